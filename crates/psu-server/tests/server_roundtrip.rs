//! Server over real sockets with simulated instruments behind it.

use psu_hardware::transport::TransportEvent;
use psu_hardware::{
    AddressRouter, DescriptorTable, Endpoint, ModelFactory, RoutingConfig, SimulatedBench,
    SimulatedInstrument,
};
use psu_server::{parse_power_reply, Dispatcher, PsuClient, PsuServer, ZmqClient};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

const PROXY: &str = "192.168.1.50:1234";

struct Running {
    addr: String,
    endpoint: String,
    stop: oneshot::Sender<()>,
    handle: tokio::task::JoinHandle<anyhow::Result<()>>,
}

async fn start(bench: &SimulatedBench) -> Running {
    let routing = RoutingConfig {
        addresses: vec!["46".into(), "48".into(), "43".into()],
        ..RoutingConfig::default()
    };
    let factory = ModelFactory::new(DescriptorTable::builtin(), Arc::new(bench.clone()));
    let router = AddressRouter::build(&routing, &factory).await;

    let server = PsuServer::new(Dispatcher::new(router))
        .listen_zmq("tcp://127.0.0.1:0")
        .await
        .unwrap()
        .listen_lines("127.0.0.1:0")
        .await
        .unwrap();
    let addr = server.local_addr().unwrap().to_string();
    let endpoint = server.zmq_endpoint().unwrap().to_string();
    let (stop, stopped) = oneshot::channel::<()>();
    let handle = tokio::spawn(server.run_until(async {
        let _ = stopped.await;
    }));
    Running {
        addr,
        endpoint,
        stop,
        handle,
    }
}

fn lab() -> SimulatedBench {
    let bench = SimulatedBench::new();
    bench.add_gpib_instrument(PROXY, 6, SimulatedInstrument::agilent_e3648a());
    bench.add_gpib_instrument(PROXY, 8, SimulatedInstrument::hp_e3633a());
    bench
}

#[tokio::test]
async fn requests_and_replies_over_tcp() {
    let bench = lab();
    let running = start(&bench).await;
    let mut client = PsuClient::connect(&running.addr).await.unwrap();

    assert_eq!(client.request("46:::TurnOn").await.unwrap(), "Turning On 46");
    let reading = parse_power_reply(&client.request("46:::ReadPower").await.unwrap()).unwrap();
    assert!(reading.on);
    assert!(!reading.is_sentinel());

    assert_eq!(client.request("17:::Ping").await.unwrap(), "Unknown Address 17");
    assert_eq!(client.request("46:::Dance").await.unwrap(), "UNKOWN COMMAND");
    assert_eq!(client.request("43:::Ping").await.unwrap(), "-1");

    running.stop.send(()).unwrap();
    running.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn requests_and_replies_over_zmq() {
    let bench = lab();
    let running = start(&bench).await;
    let mut client = ZmqClient::connect(&running.endpoint).await.unwrap();

    assert_eq!(client.request("46:::TurnOn").await.unwrap(), "Turning On 46");
    let reading = parse_power_reply(&client.request("46:::ReadPower").await.unwrap()).unwrap();
    assert!(reading.on);
    assert!(!reading.is_sentinel());

    assert_eq!(client.request("17:::Ping").await.unwrap(), "Unknown Address 17");
    assert_eq!(client.request("46:::Dance").await.unwrap(), "UNKOWN COMMAND");
    // No instrument behind 43
    assert_eq!(client.request("43:::ReadPower").await.unwrap(), "[-1, -1, -1]");

    running.stop.send(()).unwrap();
    running.handle.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_clients_never_overlap_on_the_bus() {
    let bench = lab();
    let running = start(&bench).await;
    bench.clear_events();

    let mut tasks = Vec::new();
    for address in ["46", "48", "46", "48"] {
        let addr = running.addr.clone();
        tasks.push(tokio::spawn(async move {
            let mut client = PsuClient::connect(&addr).await.unwrap();
            for verb in ["TurnOn", "ReadPower", "SetVoltage:::1.1", "Ping", "TurnOff"] {
                client.request(&format!("{}:::{}", address, verb)).await.unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(bench.peak_open(PROXY), 1);
    assert_eq!(bench.open_connections(PROXY), 0);

    // Every bracket opens and closes before the next one starts
    let mut open = false;
    for event in bench.events() {
        match event {
            TransportEvent::Connect { .. } => {
                assert!(!open, "bracket opened twice");
                open = true;
            }
            TransportEvent::Disconnect { .. } | TransportEvent::Close { .. } => open = false,
            _ => assert!(open, "I/O outside a bracket: {:?}", event),
        }
    }

    running.stop.send(()).unwrap();
    running.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_stops_accepting() {
    let bench = lab();
    let running = start(&bench).await;
    let addr = running.addr.clone();

    running.stop.send(()).unwrap();
    running.handle.await.unwrap().unwrap();
    assert!(PsuClient::connect(&addr).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_discards_queued_requests() {
    let bench = lab();
    let running = start(&bench).await;
    bench.clear_events();
    bench.set_latency(Duration::from_millis(200));

    let mut clients = Vec::new();
    for _ in 0..4 {
        let addr = running.addr.clone();
        clients.push(tokio::spawn(async move {
            if let Ok(mut client) = PsuClient::connect(&addr).await {
                let _ = client.request("46:::TurnOn").await;
            }
        }));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    running.stop.send(()).unwrap();
    running.handle.await.unwrap().unwrap();

    let turned_on = || {
        bench
            .writes_to(&Endpoint::gpib(PROXY, 6))
            .iter()
            .filter(|c| c.as_str() == "OUTP ON")
            .count()
    };
    let at_stop = turned_on();
    assert!(at_stop <= 1, "{} queued requests ran after shutdown", at_stop);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(turned_on(), at_stop);
    for client in clients {
        client.await.unwrap();
    }
}
