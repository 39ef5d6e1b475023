//! Shared setup for the driver integration tests.

#![allow(dead_code)]

use mb_driver_asm::simulator::{SimulatedAsm, SIMULATED_HOST};
use mb_driver_asm::{AcquisitionServer, AsmDriverConfig};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Configuration with the waits shortened for tests.
pub fn test_config() -> AsmDriverConfig {
    let mut config = AsmDriverConfig::new(SIMULATED_HOST);
    config.asm.connect_retry_delay_ms = 10;
    config.acquisition.image_ready_delay_ms = 0;
    config.acquisition.cancel_initial_wait_ms = 10;
    config.acquisition.single_field_timeout_secs = 10;
    config
}

pub async fn server_with(asm: Arc<SimulatedAsm>, config: AsmDriverConfig) -> AcquisitionServer {
    AcquisitionServer::with_transport(config, asm)
        .await
        .expect("server should connect to the simulator")
}

pub async fn simulated_server() -> (Arc<SimulatedAsm>, AcquisitionServer) {
    let asm = Arc::new(SimulatedAsm::new());
    let server = server_with(Arc::clone(&asm), test_config()).await;
    (asm, server)
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn wait_for<F>(description: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            description
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Await `future`, failing the test after five seconds.
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("operation timed out")
}
