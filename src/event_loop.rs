//! Readiness-driven receive loop
//!
//! One iteration: honour a pending stop or reload request, wait for the
//! session to become readable (never longer than `WAIT_CEILING`), then
//! dispatch everything it delivers in arrival order. Signals only set flags;
//! the loop acts on them between events.
//!
//! Developed by GoCortex.io

use anyhow::{anyhow, Result};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error};

use crate::dispatch::{Dispatcher, HostResolver};
use crate::inform;
use crate::reconfig::Reconfigurator;
use crate::transport::{ReceivedPdu, SessionEvent, TransportSession};
use crate::trap::{TrapClass, TrapEvent};

/// Upper bound on a single readiness wait, so flags are polled regularly.
pub const WAIT_CEILING: Duration = Duration::from_secs(5);

/// Stop and reload requests, set from signal handlers.
#[derive(Debug, Default)]
pub struct ControlFlags {
    stop: AtomicBool,
    reload: AtomicBool,
    wake: Notify,
}

impl ControlFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn request_reload(&self) {
        self.reload.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Consume a pending reload request.
    pub fn take_reload(&self) -> bool {
        self.reload.swap(false, Ordering::SeqCst)
    }

    async fn woken(&self) {
        self.wake.notified().await;
    }
}

#[derive(Debug)]
enum WaitOutcome {
    Ready,
    TimedOut,
    Woken,
    Interrupted,
    Failed(io::Error),
}

/// Counters reported when the loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub events: u64,
    pub informs_acknowledged: u64,
    pub reloads: u64,
}

/// Run until a stop is requested. A failed readiness wait closes the session
/// and is returned as an error.
pub async fn run<S, R>(
    session: &mut S,
    dispatcher: &mut Dispatcher<R>,
    reconfigurator: &mut Reconfigurator,
    flags: &ControlFlags,
) -> Result<LoopStats>
where
    S: TransportSession,
    R: HostResolver,
{
    let mut stats = LoopStats::default();

    loop {
        if flags.stop_requested() {
            debug!("Stop requested, leaving receive loop");
            break;
        }

        if flags.take_reload() {
            reconfigurator.reload(dispatcher).await;
            stats.reloads += 1;
        }

        let wait = session
            .next_timeout()
            .map_or(WAIT_CEILING, |timeout| timeout.min(WAIT_CEILING));

        let outcome = tokio::select! {
            ready = session.readable() => match ready {
                Ok(()) => WaitOutcome::Ready,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => WaitOutcome::Interrupted,
                Err(e) => WaitOutcome::Failed(e),
            },
            _ = tokio::time::sleep(wait) => WaitOutcome::TimedOut,
            _ = flags.woken() => WaitOutcome::Woken,
        };

        let events = match outcome {
            WaitOutcome::Ready => session.deliver_ready(),
            WaitOutcome::TimedOut => session.on_wait_timeout(),
            WaitOutcome::Woken | WaitOutcome::Interrupted => continue,
            WaitOutcome::Failed(e) => {
                error!("Readiness wait failed: {}", e);
                session.close();
                dispatcher.flush().await;
                return Err(anyhow!(e).context("Receive loop stopped on a failed readiness wait"));
            }
        };

        for event in events {
            match event {
                SessionEvent::MessageReceived(pdu) => {
                    stats.events += 1;
                    if handle_pdu(session, dispatcher, pdu).await {
                        stats.informs_acknowledged += 1;
                    }
                }
                SessionEvent::TimedOut => debug!("Transport session reported a timeout"),
            }
        }
    }

    session.close();
    dispatcher.flush().await;
    Ok(stats)
}

/// Dispatch one received message. Returns whether an inform was acknowledged.
async fn handle_pdu<S, R>(session: &mut S, dispatcher: &mut Dispatcher<R>, pdu: ReceivedPdu) -> bool
where
    S: TransportSession,
    R: HostResolver,
{
    let ReceivedPdu {
        message,
        peer,
        received_at,
    } = pdu;
    let pdu_type = message.pdu_type();

    let Some(mut event) = TrapEvent::from_message(message, peer.addr(), received_at) else {
        debug!("Ignoring {:?} PDU from {}", pdu_type, peer.addr());
        return false;
    };
    debug!("Received {:?} {} from {}", event.class, event.id, event.source);

    let report = dispatcher.dispatch(&mut event).await;

    if event.class == TrapClass::Inform && !report.dropped {
        return inform::acknowledge(session, &event, &peer).await;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{well_known, Message, PduBody};
    use crate::config::{CliOverrides, Config, DaemonConfig};
    use crate::output::{MemoryOutputs, Outputs};
    use crate::reconfig::ConfigSource;
    use crate::transport::mock::{MockSession, MockStep};
    use crate::transport::Peer;
    use async_snmp::{Oid, Pdu, PduType, TrapV1Pdu, Value, VarBind, Version};
    use bytes::Bytes;
    use chrono::Local;
    use std::net::IpAddr;
    use std::sync::Arc;

    type TestDispatcher = Dispatcher<fn(IpAddr) -> Option<String>>;

    fn setup(file: Config) -> (TestDispatcher, Reconfigurator, MemoryOutputs) {
        let cli = CliOverrides {
            numeric: true,
            print: true,
            ..CliOverrides::default()
        };
        let config = Arc::new(DaemonConfig::resolve(&file, &cli).unwrap());
        let (outputs, capture) = Outputs::memory();
        let no_names: fn(IpAddr) -> Option<String> = |_| None;
        let dispatcher = Dispatcher::new(config, outputs, no_names);
        (dispatcher, Reconfigurator::new(ConfigSource::Defaults, cli), capture)
    }

    fn received(pdu_type: PduType, request_id: i32, from: &str) -> SessionEvent {
        let message = Message::new(
            Version::V2c,
            Bytes::from_static(b"public"),
            PduBody::Standard(Pdu {
                pdu_type,
                request_id,
                error_status: 0,
                error_index: 0,
                varbinds: vec![
                    VarBind::new(well_known::sys_uptime(), Value::TimeTicks(100)),
                    VarBind::new(
                        well_known::snmp_trap_oid(),
                        Value::ObjectIdentifier(Oid::parse("1.3.6.1.4.1.999.1").unwrap()),
                    ),
                ],
            }),
        );
        SessionEvent::MessageReceived(ReceivedPdu {
            message,
            peer: Peer::Datagram(from.parse().unwrap()),
            received_at: Local::now(),
        })
    }

    fn cold_start(from: &str) -> SessionEvent {
        let message = Message::new(
            Version::V1,
            Bytes::from_static(b"public"),
            PduBody::TrapV1(TrapV1Pdu {
                enterprise: Oid::parse("1.3.6.1.4.1.9").unwrap(),
                agent_addr: [10, 0, 0, 1],
                generic_trap: 0,
                specific_trap: 0,
                time_stamp: 1,
                varbinds: vec![],
            }),
        );
        SessionEvent::MessageReceived(ReceivedPdu {
            message,
            peer: Peer::Datagram(from.parse().unwrap()),
            received_at: Local::now(),
        })
    }

    #[tokio::test]
    async fn test_events_dispatched_in_order_and_informs_acknowledged() {
        let flags = Arc::new(ControlFlags::new());
        let (mut dispatcher, mut reconfig, capture) = setup(Config::default());
        let mut session = MockSession::new(
            vec![
                MockStep::Ready(vec![
                    received(PduType::InformRequest, 1, "192.0.2.1:5000"),
                    cold_start("192.0.2.2:5000"),
                ]),
                MockStep::Ready(vec![
                    received(PduType::GetRequest, 2, "192.0.2.3:5000"),
                    received(PduType::TrapV2, 3, "192.0.2.4:5000"),
                    received(PduType::InformRequest, 4, "192.0.2.5:5000"),
                ]),
            ],
            flags.clone(),
        );

        let stats = run(&mut session, &mut dispatcher, &mut reconfig, &flags).await.unwrap();

        assert_eq!(stats.events, 5);
        assert_eq!(stats.informs_acknowledged, 2);
        assert!(session.closed);

        let acked: Vec<_> = session.sent.iter().map(|(_, peer)| peer.addr().to_string()).collect();
        assert_eq!(acked, vec!["192.0.2.1:5000", "192.0.2.5:5000"]);

        let printed = capture.print.records();
        assert_eq!(printed.len(), 4);
        assert!(printed[0].contains("192.0.2.1"));
        assert!(printed[1].contains("Cold Start"));
        assert!(printed[2].contains("192.0.2.4"));
        assert!(printed[3].contains("192.0.2.5"));
    }

    #[tokio::test]
    async fn test_failed_acknowledgement_not_retried() {
        let flags = Arc::new(ControlFlags::new());
        let (mut dispatcher, mut reconfig, _capture) = setup(Config::default());
        let mut session = MockSession::new(
            vec![MockStep::Ready(vec![received(PduType::InformRequest, 7, "192.0.2.1:5000")])],
            flags.clone(),
        );
        session.fail_sends = true;

        let stats = run(&mut session, &mut dispatcher, &mut reconfig, &flags).await.unwrap();
        assert_eq!(stats.events, 1);
        assert_eq!(stats.informs_acknowledged, 0);
        assert_eq!(session.send_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_wait_drives_session_timeout() {
        let flags = Arc::new(ControlFlags::new());
        let (mut dispatcher, mut reconfig, _capture) = setup(Config::default());
        let mut session = MockSession::new(vec![MockStep::Idle, MockStep::Idle], flags.clone());

        let stats = run(&mut session, &mut dispatcher, &mut reconfig, &flags).await.unwrap();
        assert_eq!(stats.events, 0);
        assert_eq!(session.wait_timeouts, 2);
    }

    #[tokio::test]
    async fn test_interrupted_wait_is_retried() {
        let flags = Arc::new(ControlFlags::new());
        let (mut dispatcher, mut reconfig, _capture) = setup(Config::default());
        let mut session = MockSession::new(
            vec![
                MockStep::WaitError(io::ErrorKind::Interrupted),
                MockStep::Ready(vec![received(PduType::TrapV2, 1, "192.0.2.4:5000")]),
            ],
            flags.clone(),
        );

        let stats = run(&mut session, &mut dispatcher, &mut reconfig, &flags).await.unwrap();
        assert_eq!(stats.events, 1);
    }

    #[tokio::test]
    async fn test_wait_failure_is_fatal() {
        let flags = Arc::new(ControlFlags::new());
        let (mut dispatcher, mut reconfig, _capture) = setup(Config::default());
        let mut session = MockSession::new(
            vec![
                MockStep::WaitError(io::ErrorKind::Other),
                MockStep::Ready(vec![received(PduType::TrapV2, 1, "192.0.2.4:5000")]),
            ],
            flags.clone(),
        );

        assert!(run(&mut session, &mut dispatcher, &mut reconfig, &flags).await.is_err());
        assert!(session.closed);
    }

    #[tokio::test]
    async fn test_reload_runs_before_next_wait() {
        let flags = Arc::new(ControlFlags::new());
        let mut file = Config::default();
        file.format2 = Some("custom %b\n".to_string());
        let (mut dispatcher, mut reconfig, capture) = setup(file);
        assert!(dispatcher.config().notification_format.is_override());

        flags.request_reload();
        let mut session = MockSession::new(
            vec![MockStep::Ready(vec![received(PduType::TrapV2, 1, "192.0.2.4:5000")])],
            flags.clone(),
        );

        let stats = run(&mut session, &mut dispatcher, &mut reconfig, &flags).await.unwrap();
        assert_eq!(stats.reloads, 1);
        assert!(!dispatcher.config().notification_format.is_override());

        let printed = capture.print.records();
        assert!(printed[0].ends_with(" Reconfigured.\n"));
        assert!(!printed[1].starts_with("custom"));
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let flags = Arc::new(ControlFlags::new());
        flags.request_stop();
        let (mut dispatcher, mut reconfig, _capture) = setup(Config::default());
        let mut session = MockSession::new(
            vec![MockStep::Ready(vec![received(PduType::TrapV2, 1, "192.0.2.4:5000")])],
            flags.clone(),
        );

        let stats = run(&mut session, &mut dispatcher, &mut reconfig, &flags).await.unwrap();
        assert_eq!(stats, LoopStats::default());
        assert!(session.closed);
    }
}
