/// Runs `f` with at most `nthreads` worker threads for data-parallel kernels.
///
/// Without the `parallel` feature everything runs on the calling thread and the cap is moot.
#[cfg(feature = "parallel")]
pub(crate) fn with_thread_cap<R: Send>(nthreads: Option<usize>, f: impl FnOnce() -> R + Send) -> R {
    let Some(n) = nthreads else {
        return f();
    };
    match rayon::ThreadPoolBuilder::new().num_threads(n).build() {
        Ok(pool) => pool.install(f),
        Err(e) => {
            tracing::warn!("Failed to build a {}-thread pool, using the global pool: {}", n, e);
            f()
        }
    }
}

#[cfg(not(feature = "parallel"))]
pub(crate) fn with_thread_cap<R: Send>(nthreads: Option<usize>, f: impl FnOnce() -> R + Send) -> R {
    if nthreads.is_some_and(|n| n > 1) {
        tracing::debug!("Thread cap of {:?} ignored without the 'parallel' feature.", nthreads);
    }
    f()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closure_result_is_returned_with_and_without_cap() {
        assert_eq!(with_thread_cap(None, || 2 + 2), 4);
        assert_eq!(with_thread_cap(Some(1), || 3 * 3), 9);
    }
}
