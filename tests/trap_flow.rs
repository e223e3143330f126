//! End-to-end receive cycle over loopback UDP

use async_snmp::{Oid, Pdu, PduType, TrapV1Pdu, Value, VarBind, Version};
use bytes::Bytes;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::UdpSocket;

use trapmux::codec::{well_known, Message, PduBody};
use trapmux::config::{CliOverrides, Config, DaemonConfig, TrapHandlerConfig};
use trapmux::dispatch::Dispatcher;
use trapmux::event_loop::{self, ControlFlags};
use trapmux::output::Outputs;
use trapmux::reconfig::{ConfigSource, Reconfigurator};
use trapmux::transport::{SessionConfig, TransportMode, TransportSession, UdpSession};

fn link_down() -> Message {
    Message::new(
        Version::V1,
        Bytes::from_static(b"public"),
        PduBody::TrapV1(TrapV1Pdu {
            enterprise: Oid::parse("1.3.6.1.4.1.8072.3.2.10").unwrap(),
            agent_addr: [127, 0, 0, 1],
            generic_trap: 2,
            specific_trap: 0,
            time_stamp: 4200,
            varbinds: vec![VarBind::new(
                Oid::parse("1.3.6.1.2.1.2.2.1.1.2").unwrap(),
                Value::Integer(2),
            )],
        }),
    )
}

fn inform(request_id: i32) -> Message {
    Message::new(
        Version::V2c,
        Bytes::from_static(b"public"),
        PduBody::Standard(Pdu {
            pdu_type: PduType::InformRequest,
            request_id,
            error_status: 0,
            error_index: 0,
            varbinds: vec![
                VarBind::new(well_known::sys_uptime(), Value::TimeTicks(300)),
                VarBind::new(
                    well_known::snmp_trap_oid(),
                    Value::ObjectIdentifier(Oid::parse("1.3.6.1.4.1.999.1").unwrap()),
                ),
            ],
        }),
    )
}

#[tokio::test]
async fn trap_and_inform_round_trip() {
    let dir = TempDir::new().unwrap();
    let feed_path = dir.path().join("handler.txt");

    let mut file = Config::default();
    file.listener.bind_address = "127.0.0.1".to_string();
    file.sinks.syslog = true;
    file.trap_handlers.push(TrapHandlerConfig {
        oid: "1.3.6.1.6.3.1.1.5.3".to_string(),
        command: format!("cat >> '{}'", feed_path.display()),
    });
    let cli = CliOverrides {
        port: Some(1162),
        print: true,
        numeric: true,
        ..CliOverrides::default()
    };
    let config = DaemonConfig::resolve(&file, &cli).unwrap();

    let session_config = SessionConfig {
        port: 0,
        ..config.session.clone()
    };
    assert_eq!(session_config.transport, TransportMode::Udp);
    let mut session = UdpSession::bind(&session_config).await.unwrap();
    let listen_addr = session.local_addr();

    let (outputs, capture) = Outputs::memory();
    let no_names = |_: IpAddr| -> Option<String> { None };
    let mut dispatcher = Dispatcher::new(Arc::new(config), outputs, no_names);
    let mut reconfig = Reconfigurator::new(ConfigSource::Defaults, cli);
    let flags = Arc::new(ControlFlags::new());

    let agent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let agent_addr = agent.local_addr().unwrap();

    let server = event_loop::run(&mut session, &mut dispatcher, &mut reconfig, &flags);
    let client = async {
        agent.send_to(&link_down().encode(), listen_addr).await.unwrap();
        agent.send_to(&inform(4242).encode(), listen_addr).await.unwrap();

        let mut buf = vec![0u8; 2048];
        let (len, from) = tokio::time::timeout(Duration::from_secs(5), agent.recv_from(&mut buf))
            .await
            .expect("no inform acknowledgement")
            .unwrap();
        flags.request_stop();
        (Message::decode(Bytes::copy_from_slice(&buf[..len])).unwrap(), from)
    };

    let (stats, (response, from)) = tokio::join!(server, client);
    let stats = stats.unwrap();

    assert_eq!(stats.events, 2);
    assert_eq!(stats.informs_acknowledged, 1);
    assert_eq!(from, listen_addr);

    let PduBody::Standard(pdu) = &response.body else {
        panic!("expected a response PDU");
    };
    assert_eq!(pdu.pdu_type, PduType::Response);
    assert_eq!(pdu.request_id, 4242);
    assert_eq!((pdu.error_status, pdu.error_index), (0, 0));

    let printed = capture.print.records();
    assert_eq!(printed.len(), 2);
    assert!(printed[0].contains("Link Down Trap (0)"), "{}", printed[0]);
    assert!(printed[1].contains(&agent_addr.ip().to_string()), "{}", printed[1]);

    let logged = capture.syslog.records();
    assert_eq!(logged.len(), 2);
    assert!(logged[0].starts_with("127.0.0.1: Link Down Trap (0) Uptime: 0:00:42.00, "), "{}", logged[0]);
    assert!(logged[1].starts_with("127.0.0.1 [127.0.0.1]: Trap "), "{}", logged[1]);

    let feed = std::fs::read_to_string(&feed_path).unwrap();
    assert_eq!(
        feed,
        "127.0.0.1\n\
         127.0.0.1\n\
         1.3.6.1.2.1.1.3.0 0:0:00:42.00\n\
         1.3.6.1.6.3.1.1.4.1.0 1.3.6.1.6.3.1.1.5.3\n\
         1.3.6.1.2.1.2.2.1.1.2 2\n\
         1.3.6.1.6.3.18.1.3.0 127.0.0.1\n\
         1.3.6.1.6.3.18.1.4.0 \"public\"\n\
         1.3.6.1.6.3.1.1.4.3.0 1.3.6.1.4.1.8072.3.2.10\n"
    );
}
