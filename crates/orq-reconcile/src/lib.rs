//! Runtime-state reconciliation: backend polling, declared-vs-observed
//! model sync, and model-download driving.

mod client;
mod cycles;

pub use client::{BackendClient, HttpBackendClient};
pub use cycles::{
    backend_sync_once, download_enqueue_once, download_job_id, download_work_once,
    register_cycles, CycleConfig, CycleDeps, ROUTINE_BACKEND_SYNC, ROUTINE_DOWNLOAD,
    ROUTINE_DOWNLOAD_WORKER, TASK_TYPE_MODEL_DOWNLOAD,
};

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn download_job_ids_are_deterministic_per_pair() {
        let backend = Uuid::new_v4();
        let a = download_job_id(backend, "llama3:8b");
        let b = download_job_id(backend, "llama3:8b");
        let c = download_job_id(backend, "mistral:7b");
        let d = download_job_id(Uuid::new_v4(), "llama3:8b");

        assert_eq!(a, b, "same pair, same id");
        assert_ne!(a, c, "different model, different id");
        assert_ne!(a, d, "different backend, different id");
    }
}
