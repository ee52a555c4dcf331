// Wi-Fi link against a fake drone on loopback sockets

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use parrotlink::commands::CommandDescriptor;
use parrotlink::discovery::StaticDiscovery;
use parrotlink::link::wifi::WifiLink;
use parrotlink::link::{Link, LinkState, SensorSink};
use parrotlink::resolver::SensorSchemaResolver;
use parrotlink::schema::SchemaCatalog;
use parrotlink::state::{SensorHub, SensorState};
use parrotlink::{Airframe, Drone, DroneFamily, LinkConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;

const RECEIVE_TIMEOUT: Duration = Duration::from_secs(2);

struct FakeDrone {
    control: SocketAddr,
    socket: UdpSocket,
    handshake: Option<JoinHandle<serde_json::Value>>,
    controller: Option<SocketAddr>,
}

impl FakeDrone {
    async fn start(status: i32) -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let control = listener.local_addr()?;
        let c2d_port = socket.local_addr()?.port();

        let handshake = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut data = vec![0u8; 4096];
            let n = stream.read(&mut data).await.unwrap();
            let request: serde_json::Value = serde_json::from_slice(&data[..n]).unwrap();
            let answer = format!("{{\"status\": {}, \"c2d_port\": {}}}\0", status, c2d_port);
            stream.write_all(answer.as_bytes()).await.unwrap();
            request
        });

        Ok(FakeDrone { control, socket, handshake: Some(handshake), controller: None })
    }

    fn discovery(&self) -> Arc<StaticDiscovery> {
        Arc::new(StaticDiscovery::new(self.control))
    }

    // Handshake request of the controller, also learns where to send datagrams
    async fn request(&mut self) -> serde_json::Value {
        let request = self.handshake.take().unwrap().await.unwrap();
        let port = request["d2c_port"].as_u64().unwrap() as u16;
        self.controller = Some(SocketAddr::from(([127, 0, 0, 1], port)));
        request
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        let mut data = vec![0u8; 2048];
        let (n, _) = tokio::time::timeout(RECEIVE_TIMEOUT, self.socket.recv_from(&mut data)).await.ok()?.ok()?;
        data.truncate(n);
        Some(data)
    }

    async fn recv_within(&self, timeout: Duration) -> Option<Vec<u8>> {
        let mut data = vec![0u8; 2048];
        let (n, _) = tokio::time::timeout(timeout, self.socket.recv_from(&mut data)).await.ok()?.ok()?;
        data.truncate(n);
        Some(data)
    }

    async fn send(&self, frame: &[u8]) {
        self.socket.send_to(frame, self.controller.unwrap()).await.unwrap();
    }
}

fn frame(kind: u8, buffer: u8, seq: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![kind, buffer, seq];
    frame.extend(((7 + payload.len()) as u32).to_le_bytes());
    frame.extend(payload);
    frame
}

fn test_config() -> LinkConfig {
    LinkConfig {
        max_packet_retries: 3,
        ack_wait_ms: 150,
        sleep_granularity_ms: 5,
        read_timeout_ms: 100,
        d2c_port: 0,
        ..LinkConfig::wifi_defaults()
    }
}

fn hub(family: DroneFamily) -> Arc<SensorHub> {
    let catalog = Arc::new(SchemaCatalog::builtin().unwrap());
    Arc::new(SensorHub::new(SensorSchemaResolver::new(catalog, family), family))
}

async fn connected(airframe: Airframe, status: i32) -> (WifiLink, FakeDrone, Arc<SensorHub>, bool) {
    let mut drone = FakeDrone::start(status).await.unwrap();
    let hub = hub(airframe.family());
    let sink: Arc<dyn SensorSink> = hub.clone();
    let mut link = WifiLink::new(airframe, test_config(), drone.discovery(), sink)
        .with_discovery_interval(Duration::from_millis(1));
    let up = link.connect(3).await;
    drone.request().await;
    (link, drone, hub, up)
}

#[tokio::test]
async fn test_handshake_declares_receive_port() {
    let mut drone = FakeDrone::start(0).await.unwrap();
    let mut link = WifiLink::new(Airframe::Mambo, test_config(), drone.discovery(), hub(DroneFamily::Minidrone))
        .with_discovery_interval(Duration::from_millis(1));
    assert!(link.connect(3).await);
    assert_eq!(link.state(), LinkState::Connected);

    let request = drone.request().await;
    assert_eq!(request["controller_type"], "computer");
    assert_eq!(request["controller_name"], "parrotlink");
    assert_ne!(request["d2c_port"], 0);
    assert!(request.get("arstream2_client_stream_port").is_none());
    assert_eq!(link.handshake_response().unwrap().status, 0);

    link.disconnect().await;
}

#[tokio::test]
async fn test_bebop_handshake_declares_stream_ports() {
    let mut drone = FakeDrone::start(0).await.unwrap();
    let mut link = WifiLink::new(Airframe::Bebop2, test_config(), drone.discovery(), hub(DroneFamily::ArDrone3))
        .with_discovery_interval(Duration::from_millis(1));
    assert!(link.connect(3).await);

    let request = drone.request().await;
    assert_eq!(request["arstream2_client_stream_port"], 55004);
    assert_eq!(request["arstream2_client_control_port"], 55005);

    link.disconnect().await;
}

#[tokio::test]
async fn test_refused_handshake_fails_connect() {
    let (link, _drone, _hub, up) = connected(Airframe::Mambo, -1).await;
    assert!(!up);
    assert_eq!(link.state(), LinkState::Disconnected);
}

#[tokio::test]
async fn test_send_with_ack_acknowledged() {
    let (mut link, drone, _hub, up) = connected(Airframe::Bebop, 0).await;
    assert!(up);

    let responder = tokio::spawn(async move {
        let command = drone.recv().await.unwrap();
        assert_eq!(command[0], 4);
        assert_eq!(command[1], 11);
        assert_eq!(&command[7..], &[1, 0, 1, 0]);
        drone.send(&frame(1, 139, 1, &[command[2]])).await;

        // the acknowledgement itself is acknowledged back on buffer 11
        let echo = drone.recv().await.unwrap();
        assert_eq!(echo, frame(1, 11, 1, &[command[2]]));
        drone
    });

    assert!(link.send_with_ack(CommandDescriptor::new(1, 0, 1), &[]).await);
    responder.await.unwrap();
    link.disconnect().await;
}

#[tokio::test]
async fn test_send_with_ack_exhausts_retries() {
    let (mut link, drone, _hub, up) = connected(Airframe::Mambo, 0).await;
    assert!(up);

    assert!(!link.send_with_ack(CommandDescriptor::new(2, 0, 1), &[]).await);

    let first = drone.recv().await.unwrap();
    let second = drone.recv().await.unwrap();
    let third = drone.recv().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(second, third);
    assert!(drone.recv_within(Duration::from_millis(100)).await.is_none());

    link.disconnect().await;
}

#[tokio::test]
async fn test_drone_data_is_acknowledged_once() {
    let (mut link, drone, hub, up) = connected(Airframe::Mambo, 0).await;
    assert!(up);

    // common.CommonState.BatteryStateChanged(55)
    drone.send(&frame(4, 127, 9, &[0, 5, 1, 0, 55])).await;

    let ack = drone.recv().await.unwrap();
    assert_eq!(ack, frame(1, 255, 1, &[9]));
    assert_eq!(ack.len(), 8);
    assert!(drone.recv_within(Duration::from_millis(200)).await.is_none());
    assert_eq!(hub.snapshot().battery, 55);

    link.disconnect().await;
}

#[tokio::test]
async fn test_unacked_data_reaches_sensors() {
    let (mut link, drone, hub, up) = connected(Airframe::Mambo, 0).await;
    assert!(up);

    // minidrone.PilotingState.FlyingStateChanged(hovering)
    drone.send(&frame(2, 126, 1, &[2, 3, 1, 0, 2, 0, 0, 0])).await;
    link.smart_sleep(Duration::from_millis(200)).await;

    assert_eq!(hub.snapshot().flying_state, "hovering");
    assert!(drone.recv_within(Duration::from_millis(100)).await.is_none());

    link.disconnect().await;
}

#[tokio::test]
async fn test_ping_is_answered() {
    let (mut link, drone, _hub, up) = connected(Airframe::Mambo, 0).await;
    assert!(up);

    drone.send(&frame(2, 0, 5, &[1, 2, 3, 4])).await;
    let pong = drone.recv().await.unwrap();
    assert_eq!(pong, frame(2, 1, 1, &[1, 2, 3, 4]));

    link.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let (mut link, _drone, _hub, up) = connected(Airframe::Mambo, 0).await;
    assert!(up);

    link.disconnect().await;
    link.disconnect().await;
    assert_eq!(link.state(), LinkState::Disconnected);
    assert!(!link.send_with_ack(CommandDescriptor::new(2, 0, 1), &[]).await);
}

#[tokio::test]
async fn test_drone_takeoff_end_to_end() {
    let mut fake = FakeDrone::start(0).await.unwrap();
    let mut drone = Drone::wifi(Airframe::Mambo, test_config(), fake.discovery()).unwrap();
    assert!(drone.connect(3).await);
    fake.request().await;

    let responder = tokio::spawn(async move {
        let command = fake.recv().await.unwrap();
        assert_eq!(&command[7..], &[2, 0, 1, 0]);
        fake.send(&frame(1, 139, 1, &[command[2]])).await;
        fake
    });

    assert!(drone.takeoff().await.unwrap());
    responder.await.unwrap();
    drone.disconnect().await;
}

#[tokio::test]
async fn test_drone_observer_on_receive_path() {
    let mut fake = FakeDrone::start(0).await.unwrap();
    let mut drone = Drone::wifi(Airframe::Mambo, test_config(), fake.discovery()).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    drone.set_observer(Some(Arc::new(move |name: &str, state: &SensorState| {
        log.lock().unwrap().push((name.to_string(), state.battery));
    })));
    assert!(drone.connect(3).await);
    fake.request().await;

    // common.CommonState.BatteryStateChanged(64)
    fake.send(&frame(2, 126, 1, &[0, 5, 1, 0, 64])).await;
    fake.send(&frame(2, 0, 2, &[9])).await;
    assert_eq!(fake.recv().await.unwrap(), frame(2, 1, 1, &[9]));

    assert_eq!(*seen.lock().unwrap(), vec![("BatteryStateChanged_battery_percent".to_string(), 64)]);
    assert_eq!(drone.sensors().battery, 64);
    drone.disconnect().await;
}
