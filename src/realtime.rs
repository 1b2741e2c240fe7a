//! Periodic fetch supervisor: owns a [`Device`], refreshes it on a
//! timer from a dedicated background thread, and surfaces lifecycle
//! events over a `crossbeam_channel` receiver — a command channel and
//! an event channel kept separate, scaled down to this driver's single
//! command (`Close`).

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::*;
use rand::Rng;

use crate::config::{RealtimeConfig, StartupGate};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::schema::Value;
use crate::transport::{ByteTransport, CancelToken};

/// Backoff between a connection-level failure and the next reopen
/// attempt.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Upper bound of the random jitter added to [`RECONNECT_BACKOFF`], so
/// a fleet of devices that all drop at once don't all retry in lockstep.
const RECONNECT_JITTER_MS: u64 = 1000;

fn reconnect_backoff() -> Duration {
    RECONNECT_BACKOFF + Duration::from_millis(rand::rng().random_range(0..RECONNECT_JITTER_MS))
}

/// A lifecycle event, delivered in order per connection generation.
#[derive(Debug)]
pub enum RealtimeEvent {
    /// The transport opened (once per generation: initial open and
    /// each subsequent reconnect).
    Open,
    /// A fetch cycle completed; `Some` iff the cycle failed.
    Update(Option<Error>),
    /// A fetch cycle completed without error. Always follows an
    /// `Update(None)` for the same cycle.
    ValidUpdate,
    /// The transport closed and all timers were cleared.
    Close,
}

enum SupervisorCommand {
    Close,
}

/// A realtime-fetch-cycle closure, invoked once per cycle after
/// `wake_up` succeeds. Variant-specific: a `VantPro2` caller will
/// typically pass `Device::rich_realtime_data`, a `VantPro` caller
/// `Device::loop1`.
pub type FetchFn<T> = Arc<dyn Fn(&mut Device<T>) -> Result<Value> + Send + Sync>;

/// Supervises one [`Device`] on a background thread.
///
/// `wait_for_update`/`wait_for_valid_update` and [`RealtimeContainer::events`]
/// all drain the same underlying channel — crossbeam channels are
/// multi-consumer, not broadcast, so mixing the helper methods with a
/// held event receiver on the same container will split events between
/// them rather than duplicate them. Pick one consumption style.
pub struct RealtimeContainer<T: ByteTransport + 'static> {
    config: RealtimeConfig,
    fetch: FetchFn<T>,
    event_send: Sender<RealtimeEvent>,
    event_recv: Receiver<RealtimeEvent>,
    command_send: Option<Sender<SupervisorCommand>>,
    cancel: Option<CancelToken>,
    thread: Option<JoinHandle<()>>,
}

impl<T: ByteTransport + 'static> RealtimeContainer<T> {
    pub fn new(
        config: RealtimeConfig,
        fetch: impl Fn(&mut Device<T>) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        let (event_send, event_recv) = crossbeam_channel::unbounded();
        Self {
            config,
            fetch: Arc::new(fetch),
            event_send,
            event_recv,
            command_send: None,
            cancel: None,
            thread: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.thread.is_some()
    }

    /// A clone of the event receiver. See the struct docs about mixing
    /// this with `wait_for_update`/`wait_for_valid_update`.
    pub fn events(&self) -> Receiver<RealtimeEvent> {
        self.event_recv.clone()
    }

    /// Take ownership of `device` and start the supervisor thread.
    /// Always invokes [`Self::close`] first, guaranteeing a single live
    /// device per container.
    pub fn open(&mut self, device: Device<T>) -> Result<()> {
        self.config.device.validate()?;
        self.close();

        let (command_send, command_recv) = crossbeam_channel::unbounded();
        let (ready_send, ready_recv) = crossbeam_channel::bounded::<()>(1);
        let event_send = self.event_send.clone();
        let fetch = Arc::clone(&self.fetch);
        let interval = self.config.update_interval;
        let gate = self.config.on_create;
        let cancel = device.cancel_token();

        let handle = std::thread::spawn(move || {
            supervisor_loop(device, command_recv, event_send, fetch, interval, gate, ready_send);
        });
        self.thread = Some(handle);
        self.command_send = Some(command_send);
        self.cancel = Some(cancel);

        if gate != StartupGate::DoNothing {
            ready_recv.recv().map_err(|_| Error::ClosedConnection)?;
        }
        Ok(())
    }

    /// Signal the supervisor thread to close and join it. Idempotent.
    ///
    /// Cancels the device's in-flight read wait first (if any), so a
    /// fetch cycle blocked in `wake_up`/`fetch` observes the close
    /// promptly instead of running out its full read timeout.
    pub fn close(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(command_send) = self.command_send.take() {
            let _ = command_send.send(SupervisorCommand::Close);
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    /// Block until the next `Update` event and return its error, if
    /// any.
    pub fn wait_for_update(&self) -> Option<Error> {
        loop {
            match self.event_recv.recv() {
                Ok(RealtimeEvent::Update(err)) => return err,
                Ok(_) => continue,
                Err(_) => return Some(Error::ClosedConnection),
            }
        }
    }

    /// Block until the next `ValidUpdate` event.
    pub fn wait_for_valid_update(&self) {
        loop {
            match self.event_recv.recv() {
                Ok(RealtimeEvent::ValidUpdate) => return,
                Ok(_) => continue,
                Err(_) => return,
            }
        }
    }
}

impl<T: ByteTransport + 'static> Drop for RealtimeContainer<T> {
    fn drop(&mut self) {
        self.close();
    }
}

fn is_connection_fault(err: &Error) -> bool {
    matches!(
        err,
        Error::ClosedConnection | Error::SerialConnectionError(_) | Error::FailedToWrite(_)
    )
}

#[allow(clippy::too_many_arguments)]
fn supervisor_loop<T: ByteTransport>(
    mut device: Device<T>,
    command_recv: Receiver<SupervisorCommand>,
    event_send: Sender<RealtimeEvent>,
    fetch: FetchFn<T>,
    interval: Duration,
    gate: StartupGate,
    ready_send: Sender<()>,
) {
    let mut first_update_sent = false;

    'generation: loop {
        match device.open() {
            Ok(()) => {
                info!("realtime device opened");
                let _ = event_send.send(RealtimeEvent::Open);
                if gate == StartupGate::WaitUntilOpen {
                    let _ = ready_send.try_send(());
                }
            }
            Err(e) => {
                error!("failed to open realtime device: {e}");
                let _ = event_send.send(RealtimeEvent::Update(Some(e)));
                if !first_update_sent && gate == StartupGate::WaitForFirstUpdate {
                    let _ = ready_send.try_send(());
                    first_update_sent = true;
                }
                match command_recv.recv_timeout(reconnect_backoff()) {
                    Ok(_) | Err(RecvTimeoutError::Disconnected) => break 'generation,
                    Err(RecvTimeoutError::Timeout) => continue 'generation,
                }
            }
        }

        'cycle: loop {
            let result = device.wake_up().and_then(|()| fetch(&mut device));
            match result {
                Ok(_) => {
                    let _ = event_send.send(RealtimeEvent::Update(None));
                    let _ = event_send.send(RealtimeEvent::ValidUpdate);
                    if !first_update_sent
                        && matches!(
                            gate,
                            StartupGate::WaitForFirstUpdate | StartupGate::WaitForFirstValidUpdate
                        )
                    {
                        let _ = ready_send.try_send(());
                        first_update_sent = true;
                    }
                }
                Err(e) => {
                    warn!("realtime fetch cycle failed: {e}");
                    let reconnect = is_connection_fault(&e);
                    let _ = event_send.send(RealtimeEvent::Update(Some(e)));
                    if !first_update_sent && gate == StartupGate::WaitForFirstUpdate {
                        let _ = ready_send.try_send(());
                        first_update_sent = true;
                    }
                    if reconnect {
                        device.close();
                        break 'cycle;
                    }
                }
            }

            match command_recv.recv_timeout(interval) {
                Ok(SupervisorCommand::Close) => break 'generation,
                Err(RecvTimeoutError::Disconnected) => break 'generation,
                Err(RecvTimeoutError::Timeout) => continue 'cycle,
            }
        }

        match command_recv.recv_timeout(reconnect_backoff()) {
            Ok(_) | Err(RecvTimeoutError::Disconnected) => break 'generation,
            Err(RecvTimeoutError::Timeout) => continue 'generation,
        }
    }

    device.close();
    let _ = event_send.send(RealtimeEvent::Close);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::crc;
    use crate::device::DeviceModel;
    use crate::protocol::ACK;
    use crate::transport::MockTransport;
    use std::time::Instant;

    fn framed(payload: &[u8]) -> Vec<u8> {
        let crc = crc::compute(payload);
        let mut out = vec![ACK];
        out.extend_from_slice(payload);
        out.extend_from_slice(&crc.to_be_bytes());
        out
    }

    fn loop1_fixture() -> Vec<u8> {
        let mut payload = vec![0u8; 99];
        payload[4] = 0;
        framed(&payload)
    }

    fn config(interval: Duration, gate: StartupGate) -> RealtimeConfig {
        let mut cfg = RealtimeConfig::new(DeviceConfig::new("/dev/mock0", DeviceModel::VantagePro));
        cfg.update_interval = interval;
        cfg.on_create = gate;
        cfg
    }

    #[test]
    fn wait_for_first_valid_update_blocks_through_a_failed_cycle_then_resolves() {
        let transport = MockTransport::new();
        // cycle 1: wake sentinel ok, but the LOOP1 reply is garbage (bad CRC).
        transport.push_inbound(&[0x0A, 0x0D]);
        let mut bad = loop1_fixture();
        *bad.last_mut().unwrap() ^= 0xFF;
        transport.push_inbound(&bad);

        // Keep a handle to the same queues so the driving thread can
        // feed cycle 2's fixture after observing cycle 1's failure.
        let transport_handle = transport.clone();
        let device = Device::new(transport, DeviceModel::VantagePro);

        let mut container = RealtimeContainer::new(
            config(Duration::from_millis(60), StartupGate::WaitForFirstValidUpdate),
            |d: &mut Device<MockTransport>| d.loop1(),
        );
        let events = container.events();

        let opened = std::thread::spawn(move || {
            container.open(device).unwrap();
            container
        });

        // Cycle 1's failure.
        let first = events.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(matches!(first, RealtimeEvent::Open));
        let second = events.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(matches!(second, RealtimeEvent::Update(Some(_))));
        assert!(!opened.is_finished());

        // Feed cycle 2's valid fixture before its wake-up fires.
        transport_handle.push_inbound(&[0x0A, 0x0D]);
        transport_handle.push_inbound(&loop1_fixture());

        let third = events.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(matches!(third, RealtimeEvent::Update(None)));
        let fourth = events.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(matches!(fourth, RealtimeEvent::ValidUpdate));

        let mut container = opened.join().unwrap();
        container.close();
    }

    #[test]
    fn do_nothing_gate_returns_before_transport_opens() {
        let transport = MockTransport::new();
        let device = Device::new(transport, DeviceModel::VantagePro);
        let mut container = RealtimeContainer::new(
            config(Duration::from_secs(10), StartupGate::DoNothing),
            |d: &mut Device<MockTransport>| d.loop1(),
        );
        let start = Instant::now();
        container.open(device).unwrap();
        assert!(start.elapsed() < Duration::from_millis(50));
        container.close();
    }

    #[test]
    fn wait_until_open_resolves_once_transport_is_open() {
        let transport = MockTransport::new();
        transport.push_inbound(&[0x0A, 0x0D]);
        transport.push_inbound(&loop1_fixture());
        let device = Device::new(transport, DeviceModel::VantagePro);
        let mut container = RealtimeContainer::new(
            config(Duration::from_secs(10), StartupGate::WaitUntilOpen),
            |d: &mut Device<MockTransport>| d.loop1(),
        );
        container.open(device).unwrap();
        assert!(container.is_open());
        container.close();
    }

    #[test]
    fn close_interrupts_an_in_flight_wake_up_wait() {
        // No bytes are ever pushed, so once the supervisor thread is
        // past `Open` it blocks inside wake_up()'s first
        // wait_for_buffer call, whose default read timeout is 2s.
        let transport = MockTransport::new();
        let device = Device::new(transport, DeviceModel::VantagePro);
        let mut container = RealtimeContainer::new(
            config(Duration::from_secs(10), StartupGate::WaitUntilOpen),
            |d: &mut Device<MockTransport>| d.loop1(),
        );
        container.open(device).unwrap();

        let start = Instant::now();
        container.close();
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn close_emits_close_event_and_stops_the_thread() {
        let transport = MockTransport::new();
        transport.push_inbound(&[0x0A, 0x0D]);
        transport.push_inbound(&loop1_fixture());
        let device = Device::new(transport, DeviceModel::VantagePro);
        let mut container = RealtimeContainer::new(
            config(Duration::from_secs(10), StartupGate::WaitForFirstUpdate),
            |d: &mut Device<MockTransport>| d.loop1(),
        );
        let events = container.events();
        container.open(device).unwrap();

        // Open() with WaitForFirstUpdate only resolves after the first
        // cycle's Update event, so Open/Update/ValidUpdate are already
        // queued by the time we get here.
        assert!(matches!(events.recv_timeout(Duration::from_secs(1)).unwrap(), RealtimeEvent::Open));
        assert!(matches!(
            events.recv_timeout(Duration::from_secs(1)).unwrap(),
            RealtimeEvent::Update(None)
        ));
        assert!(matches!(
            events.recv_timeout(Duration::from_secs(1)).unwrap(),
            RealtimeEvent::ValidUpdate
        ));

        container.close();
        assert!(!container.is_open());
        assert!(matches!(
            events.recv_timeout(Duration::from_secs(1)).unwrap(),
            RealtimeEvent::Close
        ));
    }
}
