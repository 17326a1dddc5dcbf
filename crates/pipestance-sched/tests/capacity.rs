use pipestance_sched::ResourcePool;
use proptest::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

const MAX_CORES: u32 = 6;
const MAX_MEM_GB: u32 = 10;

fn run_burst(requests: Vec<(u32, u32)>) -> (u32, u32) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("runtime should build");
    runtime.block_on(async move {
        let pool = ResourcePool::new(Some(MAX_CORES), Some(MAX_MEM_GB)).expect("pool should build");
        let cores = Arc::new(AtomicU32::new(0));
        let mem = Arc::new(AtomicU32::new(0));
        let peak_cores = Arc::new(AtomicU32::new(0));
        let peak_mem = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for (threads, mem_gb) in requests {
            let pool = pool.clone();
            let cores = Arc::clone(&cores);
            let mem = Arc::clone(&mem);
            let peak_cores = Arc::clone(&peak_cores);
            let peak_mem = Arc::clone(&peak_mem);
            handles.push(tokio::spawn(async move {
                let lease = pool
                    .acquire(threads, mem_gb)
                    .await
                    .expect("lease should be granted");
                let now_cores = cores.fetch_add(lease.threads, Ordering::SeqCst) + lease.threads;
                let now_mem = mem.fetch_add(lease.mem_gb, Ordering::SeqCst) + lease.mem_gb;
                peak_cores.fetch_max(now_cores, Ordering::SeqCst);
                peak_mem.fetch_max(now_mem, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
                cores.fetch_sub(lease.threads, Ordering::SeqCst);
                mem.fetch_sub(lease.mem_gb, Ordering::SeqCst);
                drop(lease);
            }));
        }
        for handle in handles {
            handle.await.expect("job task should join");
        }
        (
            peak_cores.load(Ordering::SeqCst),
            peak_mem.load(Ordering::SeqCst),
        )
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn concurrent_admission_never_exceeds_configured_capacity(
        requests in prop::collection::vec((0u32..12, 0u32..16), 1..40)
    ) {
        let (peak_cores, peak_mem) = run_burst(requests);
        prop_assert!(peak_cores <= MAX_CORES, "peak cores {peak_cores} > {MAX_CORES}");
        prop_assert!(peak_mem <= MAX_MEM_GB, "peak mem {peak_mem} > {MAX_MEM_GB}");
    }
}
