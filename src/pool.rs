use std::env;

/// Run `action` inside a dedicated rayon pool of `threads` workers, falling
/// back to the caller's thread if the pool cannot be built.
pub fn with_pool<T, F>(threads: usize, action: F) -> T
where
    F: FnOnce() -> T + Send,
    T: Send,
{
    match rayon::ThreadPoolBuilder::new().num_threads(threads).build() {
        Ok(pool) => pool.install(action),
        Err(_) => action(),
    }
}

/// Worker-pool sizing from the environment, clamped to something sane.
pub fn env_parallelism(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|val| val.parse::<usize>().ok())
        .unwrap_or(default)
        .clamp(2, 32)
}

#[cfg(test)]
mod tests {
    use super::with_pool;

    #[test]
    fn with_pool_runs_the_action() {
        let doubled = with_pool(2, || (1..=4).map(|n| n * 2).sum::<i32>());
        assert_eq!(doubled, 20);
    }
}
