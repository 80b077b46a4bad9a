//! Two virtual PMUs and the islanding aggregator wired together over an in-process
//! bus, with real C37.118 sessions between them.

#[cfg(test)]
mod tests {
    use ltbnet_core::aggregator::EVENT_VAR;
    use ltbnet_core::bus::{
        BusIndices, Idxvgs, MemoryHub, PmuData, PmuIndices, SharedBus, SysParam, SIM_TARGET,
    };
    use ltbnet_core::config::{AggregatorConfig, PmuConfig, SourceAddr};
    use ltbnet_core::islanding::IslandingState;
    use ltbnet_core::pdc_client::PdcClient;
    use ltbnet_core::pmu::VirtualPmu;
    use ltbnet_core::pmu_server::PmuServer;
    use ltbnet_core::{PdcAggregator, Result};

    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    const BUSES: usize = 2;

    fn idxvgs() -> Idxvgs {
        Idxvgs {
            pmu: PmuIndices {
                vm: vec![1.0, 2.0],
                am: vec![3.0, 4.0],
            },
            bus: BusIndices {
                w_busfreq: vec![5.0, 6.0],
            },
            ..Default::default()
        }
    }

    fn start_pmu(
        hub: &MemoryHub,
        node: u32,
        stop: &Arc<AtomicBool>,
    ) -> (u16, thread::JoinHandle<Result<()>>) {
        let name = format!("PMU_{}", node);
        let server = PmuServer::bind("127.0.0.1", 0).expect("Failed to bind PMU server");
        let port = server.local_addr().port();
        let config = PmuConfig {
            name: name.clone(),
            nodes: vec![node],
            listen_ip: "127.0.0.1".to_string(),
            port,
            ..Default::default()
        };
        let mut pmu = VirtualPmu::new(config, server).unwrap();
        let bus = SharedBus::new(hub.client(&name));
        let stop = Arc::clone(stop);
        let handle = thread::spawn(move || {
            pmu.run(&bus, &stop)?;
            Ok(())
        });
        (port, handle)
    }

    #[test]
    fn test_divergent_regions_trip_once() {
        let hub = MemoryHub::new();
        let stop = Arc::new(AtomicBool::new(false));

        let (port_1, pmu_1) = start_pmu(&hub, 1, &stop);
        let (port_2, pmu_2) = start_pmu(&hub, 2, &stop);

        for pmu in ["PMU_1", "PMU_2"] {
            hub.send_var(pmu, "SysParam", &SysParam::default()).unwrap();
            hub.send_var(pmu, "Idxvgs", &idxvgs()).unwrap();
            hub.send(pmu, "Varheader", json!(vec!["x"; 3 * BUSES]));
        }
        // Let both PMUs configure before the aggregator asks for their frames.
        thread::sleep(Duration::from_millis(200));

        let config = AggregatorConfig {
            sources: vec![
                SourceAddr {
                    ip: "127.0.0.1".to_string(),
                    port: port_1,
                    idcode: 1,
                },
                SourceAddr {
                    ip: "127.0.0.1".to_string(),
                    port: port_2,
                    idcode: 2,
                },
            ],
            islanding_delay: Duration::from_millis(300),
            ..Default::default()
        };
        let mut aggregator = PdcAggregator::new(config).unwrap();
        let agg_bus = SharedBus::new(hub.client("ISLANDING"));
        hub.send_var("ISLANDING", "SysParam", &SysParam::default()).unwrap();

        let agg_handle = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let result = aggregator.run(
                    &agg_bus,
                    |addr: &SourceAddr| PdcClient::connect(&addr.ip, addr.port, addr.idcode),
                    &stop,
                );
                (aggregator, result)
            })
        };

        // `[vm, am, w]` per bus; bus 2 runs 0.6 Hz fast.
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut t = 0.0;
        while hub.pending(SIM_TARGET) == 0 {
            assert!(Instant::now() < deadline, "No islanding event published");
            let data = PmuData {
                t,
                vars: vec![1.0, 0.0, 1.0, 1.0, 0.0, 1.01],
            };
            hub.send_var("PMU_1", "pmudata", &data).unwrap();
            hub.send_var("PMU_2", "pmudata", &data).unwrap();
            t += 0.01;
            thread::sleep(Duration::from_millis(10));
        }
        // Give the loop a chance to (wrongly) publish again.
        thread::sleep(Duration::from_millis(200));

        stop.store(true, Ordering::Relaxed);
        let (aggregator, result) = agg_handle.join().unwrap();
        result.unwrap();
        pmu_1.join().unwrap().unwrap();
        pmu_2.join().unwrap().unwrap();

        let events = hub.drain(SIM_TARGET);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, EVENT_VAR);
        assert_eq!(events[0].1["name"], json!(["Line", "Line", "Line"]));
        assert_eq!(aggregator.state(), IslandingState::Tripped);
        assert_eq!(
            aggregator.header(0).map(|h| h.data.as_str()),
            Some("MiniPMU <PMU_1> [1]")
        );
        assert!(aggregator.configuration(1).is_some());
    }
}
