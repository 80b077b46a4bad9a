//! The tokio hub against the blocking bus client the PMU and aggregator use.

#[cfg(test)]
mod tests {
    use ltbnet_cli::bus_server::{serve, Hub};
    use ltbnet_core::bus::tcp::TcpBusClient;
    use ltbnet_core::bus::{BusClient, SharedBus, SysParam, WorkspaceVar};
    use serde_json::json;
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn start_hub() -> String {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind hub");
        let address = format!("tcp://{}", listener.local_addr().unwrap());
        tokio::spawn(serve(listener, Hub::new()));
        address
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_send_broadcast_and_sync() {
        let address = start_hub().await;

        tokio::task::spawn_blocking(move || {
            let mut pmu = TcpBusClient::connect("PMU_1", &address).unwrap();
            // An empty sync also confirms the registration went through.
            assert_eq!(pmu.poll(Duration::from_millis(20)).unwrap(), None);

            let mut sim = TcpBusClient::connect("sim", &address).unwrap();
            sim.broadcast("SysParam", &json!({"Bus": []})).unwrap();
            sim.publish("PMU_1", "DONE", &json!(1)).unwrap();

            let first = pmu.poll(Duration::from_secs(2)).unwrap();
            assert_eq!(first, Some(("SysParam".to_string(), json!({"Bus": []}))));
            let second = pmu.poll(Duration::from_secs(2)).unwrap();
            assert_eq!(second, Some(("DONE".to_string(), json!(1))));

            // The broadcaster does not hear itself.
            assert_eq!(sim.poll(Duration::from_millis(20)).unwrap(), None);
        })
        .await
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_mailbox_survives_reconnect() {
        let address = start_hub().await;

        tokio::task::spawn_blocking(move || {
            let mut first = TcpBusClient::connect("ISLANDING", &address).unwrap();
            assert_eq!(first.poll(Duration::from_millis(10)).unwrap(), None);
            drop(first);

            let mut sim = TcpBusClient::connect("sim", &address).unwrap();
            sim.publish("ISLANDING", "SysParam", &json!(SysParam::default()))
                .unwrap();

            let bus = SharedBus::new(TcpBusClient::connect("ISLANDING", &address).unwrap());
            match bus.poll_var(Duration::from_secs(2)).unwrap() {
                Some(WorkspaceVar::SysParam(_)) => {}
                other => panic!("Unexpected variable: {:?}", other),
            }
        })
        .await
        .unwrap();
    }
}
