//! Connection manager for one physical board.
//!
//! A `Board` owns at most one transport and the protocol client attached to
//! it. Every transport install and every release bumps the board generation;
//! signals are delivered through a sink stamped with the generation it was
//! created under and are dropped when that no longer matches.

use boardlink_hal::config::BoardConfig;
use boardlink_hal::traits::{
    HalError, PortProvider, ProtocolClient, ProtocolFactory, Signal, SignalHandler, Transport,
};
use boardlink_hal::types::{FirmwareInfo, HIGH, InputBias, LOW, PinMode, PortDescriptor};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::time::{Instant, timeout};

use crate::error::BoardError;
use crate::events::{BoardEvent, HostEvent, HostNotifier};
use crate::pins::{Pin, PinTable, ReadKind, ReadPlan};

pub type BoardId = u64;

static NEXT_BOARD_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Requesting,
    Connected,
    Ready,
}

pub(crate) type ReleaseHook = Box<dyn FnOnce(&Board) + Send>;

struct Link {
    transport: Arc<dyn Transport>,
    client: Option<Arc<dyn ProtocolClient>>,
}

struct BoardState {
    state: ConnectionState,
    generation: u64,
    link: Option<Link>,
    owner_id: Option<String>,
    descriptor: Option<PortDescriptor>,
    firmware: Option<FirmwareInfo>,
    pins: PinTable,
    ready_waiter: Option<oneshot::Sender<Result<(), BoardError>>>,
    /// Ready arrived before the protocol client handle was stored.
    ready_pending: bool,
    release_hooks: Vec<ReleaseHook>,
}

impl BoardState {
    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && self.link.is_some()
    }

    fn ready_client(&self) -> Result<(u64, Arc<dyn ProtocolClient>), BoardError> {
        if self.state != ConnectionState::Ready {
            return Err(BoardError::NotConnected);
        }
        self.link
            .as_ref()
            .and_then(|link| link.client.clone())
            .map(|client| (self.generation, client))
            .ok_or(BoardError::NotConnected)
    }
}

struct BoardShared {
    id: BoardId,
    config: BoardConfig,
    ports: Arc<dyn PortProvider>,
    protocol: Arc<dyn ProtocolFactory>,
    host: HostNotifier,
    events: broadcast::Sender<BoardEvent>,
    state: Mutex<BoardState>,
}

/// Handle to one board connection. Clones share the same connection.
#[derive(Clone)]
pub struct Board {
    shared: Arc<BoardShared>,
}

/// Signal sink handed to one protocol client instance.
struct GenerationSink {
    generation: u64,
    board: Weak<BoardShared>,
}

impl SignalHandler for GenerationSink {
    fn on_signal(&self, signal: Signal) {
        if let Some(shared) = self.board.upgrade() {
            Board { shared }.handle_signal(self.generation, signal);
        }
    }
}

/// Clears the in-flight flag of a pin when the read leaves scope.
struct UpdatingGuard<'a> {
    board: &'a Board,
    epoch: u64,
    pin: u8,
}

impl Drop for UpdatingGuard<'_> {
    fn drop(&mut self) {
        let mut st = self.board.lock();
        if st.pins.epoch() == self.epoch {
            st.pins.finish(self.pin);
        }
    }
}

/// A read that has been registered and is waiting for its sample.
struct PendingRead {
    kind: ReadKind,
    pin: u8,
    generation: u64,
    client: Arc<dyn ProtocolClient>,
    mode_change: Option<PinMode>,
    sample: oneshot::Receiver<u16>,
    deadline: Duration,
}

impl Board {
    pub fn new(
        config: BoardConfig,
        ports: Arc<dyn PortProvider>,
        protocol: Arc<dyn ProtocolFactory>,
        host: HostNotifier,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            shared: Arc::new(BoardShared {
                id: NEXT_BOARD_ID.fetch_add(1, Ordering::Relaxed),
                config,
                ports,
                protocol,
                host,
                events,
                state: Mutex::new(BoardState {
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    link: None,
                    owner_id: None,
                    descriptor: None,
                    firmware: None,
                    pins: PinTable::default(),
                    ready_waiter: None,
                    ready_pending: false,
                    release_hooks: Vec::new(),
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BoardState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: BoardEvent) {
        let _ = self.shared.events.send(event);
    }

    pub fn id(&self) -> BoardId {
        self.shared.id
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Ready
        )
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Incremented on every transport install and on every release.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn owner_id(&self) -> Option<String> {
        self.lock().owner_id.clone()
    }

    pub fn set_owner(&self, owner_id: impl Into<String>) {
        self.lock().owner_id = Some(owner_id.into());
    }

    /// Port identity captured when the current (or last) transport opened.
    pub fn descriptor(&self) -> Option<PortDescriptor> {
        self.lock().descriptor.clone()
    }

    pub fn firmware(&self) -> Option<FirmwareInfo> {
        self.lock().firmware.clone()
    }

    pub fn pin(&self, index: u8) -> Option<Pin> {
        self.lock().pins.get(index).cloned()
    }

    pub fn pin_count(&self) -> usize {
        self.lock().pins.len()
    }

    pub fn analog_pins(&self) -> Vec<u8> {
        self.lock().pins.analog_pins().to_vec()
    }

    /// Pins that support `mode`, excluding analog inputs. Empty unless the
    /// board is connected and has reported its topology.
    pub fn pins_supporting(&self, mode: PinMode) -> Vec<u8> {
        let st = self.lock();
        if st.link.is_none() {
            return Vec::new();
        }
        st.pins.pins_supporting(mode)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BoardEvent> {
        self.shared.events.subscribe()
    }

    /// Run `hook` once on the next release. Returns false (and drops the
    /// hook) if the board is already disconnected.
    pub(crate) fn on_release(&self, hook: ReleaseHook) -> bool {
        let mut st = self.lock();
        if st.state == ConnectionState::Disconnected {
            return false;
        }
        st.release_hooks.push(hook);
        true
    }

    /// Open a port, attach the protocol client and wait for the handshake.
    pub async fn connect(&self) -> Result<(), BoardError> {
        let config = &self.shared.config;
        let attempt = {
            let mut st = self.lock();
            match st.state {
                ConnectionState::Connected | ConnectionState::Ready => return Ok(()),
                ConnectionState::Requesting => return Err(BoardError::Busy),
                ConnectionState::Disconnected => {}
            }
            st.state = ConnectionState::Requesting;
            st.generation += 1;
            st.generation
        };
        log::info!("board {}: requesting port", self.id());

        let port = match self.shared.ports.request_port(&config.filters).await {
            Ok(port) => port,
            Err(err) => return Err(self.abort(attempt, err.into())),
        };

        let transport = match timeout(
            config.open_timeout(),
            self.shared.ports.open(&port, config.baud_rate),
        )
        .await
        {
            Ok(Ok(transport)) => transport,
            Ok(Err(err)) => return Err(self.abort(attempt, err.into())),
            Err(_) => {
                return Err(self.abort(attempt, BoardError::Connection(format!(
                    "opening {port} timed out after {:?}",
                    config.open_timeout()
                ))));
            }
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        let generation = {
            let mut st = self.lock();
            if st.generation != attempt || st.state != ConnectionState::Requesting {
                drop(st);
                close_transport(&transport);
                return Err(BoardError::Connection(
                    "connection attempt was superseded".to_string(),
                ));
            }
            st.generation += 1;
            st.descriptor = Some(transport.descriptor().clone());
            st.link = Some(Link {
                transport: transport.clone(),
                client: None,
            });
            st.ready_waiter = Some(ready_tx);
            st.ready_pending = false;
            st.generation
        };

        let sink = Arc::new(GenerationSink {
            generation,
            board: Arc::downgrade(&self.shared),
        });
        let client = match self.shared.protocol.attach(transport, sink) {
            Ok(client) => client,
            Err(err) => return Err(self.abort(generation, err.into())),
        };
        let ready_pending = {
            let mut st = self.lock();
            if !st.is_current(generation) {
                return Err(BoardError::Connection(
                    "connection attempt was superseded".to_string(),
                ));
            }
            if let Some(link) = st.link.as_mut() {
                link.client = Some(client);
            }
            std::mem::take(&mut st.ready_pending)
        };
        self.on_open(generation);
        if ready_pending {
            self.on_ready(generation);
        }

        let handshake = config.handshake_timeout();
        match timeout(handshake, ready_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BoardError::Connection(
                "board was released before the handshake completed".to_string(),
            )),
            Err(_) => {
                log::warn!("board {}: no handshake within {handshake:?}", self.id());
                Err(self.abort(generation, BoardError::HandshakeTimeout(handshake)))
            }
        }
    }

    /// Release a failed attempt unless a newer one already replaced it.
    fn abort(&self, generation: u64, err: BoardError) -> BoardError {
        log::warn!("board {}: connect failed: {err}", self.id());
        if self.generation() == generation {
            self.release();
        }
        err
    }

    /// Best-effort reset of the device, then release.
    pub fn disconnect(&self) {
        let client = {
            let st = self.lock();
            if st.state == ConnectionState::Disconnected {
                return;
            }
            st.link.as_ref().and_then(|link| link.client.clone())
        };
        if let Some(client) = client {
            if let Err(err) = client.reset() {
                log::debug!("board {}: reset not delivered: {err}", self.id());
            }
        }
        self.release();
    }

    /// Tear down the connection. Only the first call after a connection
    /// does any work and emits `BoardEvent::Released`.
    pub fn release(&self) {
        let (link, hooks) = {
            let mut st = self.lock();
            if st.state == ConnectionState::Disconnected {
                return;
            }
            st.state = ConnectionState::Disconnected;
            st.generation += 1;
            st.owner_id = None;
            st.ready_waiter = None;
            st.ready_pending = false;
            st.pins.clear_waiters();
            (st.link.take(), std::mem::take(&mut st.release_hooks))
        };

        if let Some(link) = link {
            close_transport(&link.transport);
        }
        log::info!("board {}: released", self.id());
        self.emit(BoardEvent::Released);
        for hook in hooks {
            hook(self);
        }
    }

    /// Report a lost link to the host, then disconnect.
    pub fn handle_disconnect_error(&self, cause: &str) {
        let owner = {
            let st = self.lock();
            if st.state == ConnectionState::Disconnected {
                return;
            }
            st.owner_id.clone().unwrap_or_default()
        };
        log::warn!("board {}: connection lost: {cause}", self.id());
        self.shared
            .host
            .notify(HostEvent::PeripheralConnectionLostError {
                message: cause.to_string(),
                extension_id: owner,
            });
        self.disconnect();
    }

    fn handle_signal(&self, generation: u64, signal: Signal) {
        if !self.lock().is_current(generation) {
            log::debug!(
                "board {}: dropped stale {signal:?} from generation {generation}",
                self.id()
            );
            return;
        }
        match signal {
            Signal::Open => self.on_open(generation),
            Signal::Ready => self.on_ready(generation),
            Signal::Close => self.on_lost(generation, "connection closed", false),
            Signal::Error(cause) => self.on_lost(generation, &cause, true),
            Signal::Disconnect => self.on_lost(generation, "device disconnected", true),
            Signal::DigitalSample { pin, value } => {
                let mut st = self.lock();
                if st.is_current(generation) {
                    st.pins.resolve(ReadKind::Digital, pin, value);
                }
            }
            Signal::AnalogSample { channel, value } => {
                let mut st = self.lock();
                if st.is_current(generation) {
                    if let Some(pin) = st.pins.analog_pin(channel) {
                        st.pins.resolve(ReadKind::Analog, pin, value);
                    }
                }
            }
        }
    }

    fn on_open(&self, generation: u64) {
        {
            let mut st = self.lock();
            if !st.is_current(generation) || st.state != ConnectionState::Requesting {
                return;
            }
            st.state = ConnectionState::Connected;
        }
        log::info!("board {}: transport open", self.id());
        self.emit(BoardEvent::Connected);
    }

    fn on_ready(&self, generation: u64) {
        let client = {
            let mut st = self.lock();
            if !st.is_current(generation)
                || !matches!(
                    st.state,
                    ConnectionState::Requesting | ConnectionState::Connected
                )
            {
                return;
            }
            match st.link.as_ref().and_then(|link| link.client.clone()) {
                Some(client) => client,
                None => {
                    st.ready_pending = true;
                    return;
                }
            }
        };

        let topology = client.topology();
        let firmware = client.firmware();
        let config = &self.shared.config;
        if config.init_i2c {
            if let Err(err) = client.i2c_config(config.i2c_delay_us) {
                log::warn!("board {}: bus init failed: {err}", self.id());
            }
        }

        let waiter = {
            let mut st = self.lock();
            if !st.is_current(generation) {
                return;
            }
            st.pins = PinTable::from_topology(&topology, generation);
            st.firmware = firmware.clone();
            st.state = ConnectionState::Ready;
            st.ready_waiter.take()
        };
        match &firmware {
            Some(fw) => log::info!(
                "board {}: ready, {fw}, {} pins",
                self.id(),
                topology.pins.len()
            ),
            None => log::info!("board {}: ready, {} pins", self.id(), topology.pins.len()),
        }
        self.emit(BoardEvent::Ready);
        if let Some(waiter) = waiter {
            let _ = waiter.send(Ok(()));
        }
    }

    fn on_lost(&self, generation: u64, cause: &str, notify_host: bool) {
        let waiter = {
            let mut st = self.lock();
            if !st.is_current(generation) {
                return;
            }
            st.ready_waiter.take()
        };
        if let Some(waiter) = waiter {
            let _ = waiter.send(Err(BoardError::UnexpectedDisconnect(cause.to_string())));
        }
        if notify_host {
            self.handle_disconnect_error(cause);
        } else {
            self.release();
        }
    }

    /// Run a fire-and-forget protocol command. Failures are logged; a dead
    /// link tears the board down.
    fn fire(&self, what: &str, command: impl FnOnce() -> Result<(), HalError>) {
        if let Err(err) = command() {
            log::warn!("board {}: {what} failed: {err}", self.id());
            if err.is_fatal() {
                self.handle_disconnect_error(&err.to_string());
            }
        }
    }

    async fn pace(&self) {
        tokio::time::sleep(self.shared.config.write_pacing()).await;
    }

    /// Read the level of digital pin `pin`.
    pub async fn read_digital(&self, pin: u8) -> Result<bool, BoardError> {
        let config = &self.shared.config;
        let (read, epoch) = {
            let mut st = self.lock();
            let (generation, client) = st.ready_client()?;
            let plan = st.pins.plan_read(
                ReadKind::Digital,
                pin,
                Instant::now(),
                config.digital_read_interval(),
            )?;
            if let ReadPlan::Cached(value) = plan {
                return Ok(value != LOW);
            }
            let mode_change = st.pins.apply_bias(pin)?;
            let sample = st.pins.begin_read(ReadKind::Digital, pin)?;
            let read = PendingRead {
                kind: ReadKind::Digital,
                pin,
                generation,
                client,
                mode_change,
                sample,
                deadline: config.digital_read_timeout(),
            };
            (read, st.pins.epoch())
        };
        let _guard = UpdatingGuard {
            board: self,
            epoch,
            pin,
        };
        let value = self
            .sample(read, |client, on| client.report_digital(pin, on))
            .await?;
        Ok(value != LOW)
    }

    /// Read analog channel `channel` (A0 is channel 0).
    pub async fn read_analog(&self, channel: u8) -> Result<u16, BoardError> {
        let config = &self.shared.config;
        let (read, epoch) = {
            let mut st = self.lock();
            let (generation, client) = st.ready_client()?;
            let pin = st
                .pins
                .analog_pin(channel)
                .ok_or(BoardError::InvalidPin(channel))?;
            let plan = st.pins.plan_read(
                ReadKind::Analog,
                pin,
                Instant::now(),
                config.analog_read_interval(),
            )?;
            if let ReadPlan::Cached(value) = plan {
                return Ok(value);
            }
            let mode_change = st.pins.switch_mode(pin, PinMode::Analog)?;
            let sample = st.pins.begin_read(ReadKind::Analog, pin)?;
            let read = PendingRead {
                kind: ReadKind::Analog,
                pin,
                generation,
                client,
                mode_change,
                sample,
                deadline: config.analog_read_timeout(),
            };
            (read, st.pins.epoch())
        };
        let pin = read.pin;
        let _guard = UpdatingGuard {
            board: self,
            epoch,
            pin,
        };
        self.sample(read, |client, on| client.report_analog(channel, on))
            .await
    }

    /// Enable reporting, wait for one sample or the deadline, disable
    /// reporting. The in-flight flag is owned by the caller's guard.
    async fn sample(
        &self,
        read: PendingRead,
        report: impl Fn(&dyn ProtocolClient, bool) -> Result<(), HalError>,
    ) -> Result<u16, BoardError> {
        let PendingRead {
            kind,
            pin,
            generation,
            client,
            mode_change,
            sample,
            deadline,
        } = read;

        let requested = mode_change
            .map_or(Ok(()), |mode| client.set_pin_mode(pin, mode))
            .and_then(|()| report(client.as_ref(), true));
        if let Err(err) = requested {
            self.fail_read(generation, kind, pin);
            if err.is_fatal() {
                self.handle_disconnect_error(&err.to_string());
            }
            return Err(err.into());
        }

        match timeout(deadline, sample).await {
            Ok(Ok(value)) => {
                {
                    let mut st = self.lock();
                    if st.is_current(generation) {
                        st.pins.store(pin, value, Instant::now());
                    }
                }
                if let Err(err) = report(client.as_ref(), false) {
                    log::debug!("board {}: stop reporting pin {pin}: {err}", self.id());
                }
                Ok(value)
            }
            Ok(Err(_)) => {
                self.fail_read(generation, kind, pin);
                Err(BoardError::NotConnected)
            }
            Err(_) => {
                log::debug!("board {}: pin {pin} read timed out", self.id());
                self.fail_read(generation, kind, pin);
                Err(BoardError::ReadTimeout {
                    pin,
                    timeout: deadline,
                })
            }
        }
    }

    fn fail_read(&self, generation: u64, kind: ReadKind, pin: u8) {
        let mut st = self.lock();
        if st.is_current(generation) {
            st.pins.fail(kind, pin);
        }
    }

    /// Select the pull-up (or plain) input mode for `pin`.
    pub async fn set_input_bias(&self, pin: u8, pull_up: bool) -> Result<(), BoardError> {
        let (client, mode) = {
            let mut st = self.lock();
            let (_, client) = st.ready_client()?;
            let mode = st.pins.set_bias(pin, InputBias::from_pull_up(pull_up))?;
            (client, mode)
        };
        self.fire("set pin mode", || client.set_pin_mode(pin, mode));
        self.pace().await;
        Ok(())
    }

    fn prepare_output(
        &self,
        pin: u8,
        mode: PinMode,
    ) -> Result<(Arc<dyn ProtocolClient>, Option<PinMode>), BoardError> {
        let mut st = self.lock();
        let (_, client) = st.ready_client()?;
        let change = st.pins.switch_mode(pin, mode)?;
        Ok((client, change))
    }

    fn output_command(
        client: &dyn ProtocolClient,
        pin: u8,
        mode_change: Option<PinMode>,
        write: impl FnOnce() -> Result<(), HalError>,
    ) -> Result<(), HalError> {
        if let Some(mode) = mode_change {
            client.set_pin_mode(pin, mode)?;
        }
        write()
    }

    pub async fn write_digital(&self, pin: u8, value: bool, enqueue: bool) -> Result<(), BoardError> {
        let (client, change) = self.prepare_output(pin, PinMode::Output)?;
        let level = if value { HIGH } else { LOW };
        self.fire("digital write", || {
            Self::output_command(client.as_ref(), pin, change, || {
                client.write_digital(pin, level, enqueue)
            })
        });
        self.pace().await;
        Ok(())
    }

    pub async fn write_pwm(&self, pin: u8, value: u16) -> Result<(), BoardError> {
        let (client, change) = self.prepare_output(pin, PinMode::Pwm)?;
        self.fire("pwm write", || {
            Self::output_command(client.as_ref(), pin, change, || client.write_pwm(pin, value))
        });
        self.pace().await;
        Ok(())
    }

    pub async fn write_servo(&self, pin: u8, value: u16) -> Result<(), BoardError> {
        let (client, change) = self.prepare_output(pin, PinMode::Servo)?;
        self.fire("servo write", || {
            Self::output_command(client.as_ref(), pin, change, || client.write_servo(pin, value))
        });
        self.pace().await;
        Ok(())
    }
}

fn close_transport(transport: &Arc<dyn Transport>) {
    if !transport.is_open() {
        return;
    }
    if let Err(err) = transport.close() {
        log::warn!("closing {} failed: {err}", transport.descriptor());
    }
}

impl fmt::Debug for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.lock();
        f.debug_struct("Board")
            .field("id", &self.shared.id)
            .field("state", &st.state)
            .field("generation", &st.generation)
            .field("owner_id", &st.owner_id)
            .field("descriptor", &st.descriptor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boardlink_hal::sim::SimBoard;
    use tokio::sync::mpsc;

    fn sim_board(sim: &SimBoard) -> (Board, mpsc::UnboundedReceiver<HostEvent>) {
        let (host, rx) = HostNotifier::channel();
        let board = Board::new(
            BoardConfig::default(),
            Arc::new(sim.clone()),
            Arc::new(sim.clone()),
            host,
        );
        (board, rx)
    }

    async fn ready_board(sim: &SimBoard) -> (Board, mpsc::UnboundedReceiver<HostEvent>) {
        let (board, rx) = sim_board(sim);
        board.set_owner("ext-A");
        board.connect().await.unwrap();
        (board, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn connect_walks_through_requesting_connected_ready() {
        let sim = SimBoard::new();
        let (board, _rx) = sim_board(&sim);
        let mut events = board.subscribe();
        assert_eq!(board.state(), ConnectionState::Disconnected);

        board.connect().await.unwrap();
        assert_eq!(board.state(), ConnectionState::Ready);
        assert_eq!(events.try_recv().unwrap(), BoardEvent::Connected);
        assert_eq!(events.try_recv().unwrap(), BoardEvent::Ready);
        assert_eq!(board.pin_count(), 20);
        assert_eq!(board.analog_pins(), vec![14, 15, 16, 17, 18, 19]);
        assert_eq!(board.descriptor(), Some(sim.descriptor()));
        assert_eq!(board.firmware().unwrap().name, "StandardFirmata.ino");
        assert_eq!(sim.stats().i2c_configs, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_idempotent_once_ready() {
        let sim = SimBoard::new();
        let (board, _rx) = ready_board(&sim).await;
        let generation = board.generation();
        board.connect().await.unwrap();
        assert_eq!(board.generation(), generation);
        assert_eq!(sim.stats().opens, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn open_failure_leaves_board_disconnected() {
        let sim = SimBoard::new();
        sim.set_open_error(Some("permission denied"));
        let (board, _rx) = sim_board(&sim);
        let err = board.connect().await.unwrap_err();
        assert!(matches!(err, BoardError::Connection(_)));
        assert_eq!(board.state(), ConnectionState::Disconnected);
        assert!(!sim.is_transport_open());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_open_hits_the_open_deadline() {
        let sim = SimBoard::new();
        sim.set_open_delay(Duration::from_secs(60));
        let (board, _rx) = sim_board(&sim);
        let err = board.connect().await.unwrap_err();
        assert!(matches!(err, BoardError::Connection(msg) if msg.contains("timed out")));
        assert_eq!(board.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_handshake_times_out_and_releases() {
        let sim = SimBoard::new();
        sim.set_send_ready(false);
        let (board, _rx) = sim_board(&sim);
        let err = board.connect().await.unwrap_err();
        assert_eq!(
            err,
            BoardError::HandshakeTimeout(BoardConfig::default().handshake_timeout())
        );
        assert_eq!(board.state(), ConnectionState::Disconnected);
        assert!(!sim.is_transport_open());
        assert_eq!(sim.stats().closes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn error_during_handshake_rejects_connect() {
        let sim = SimBoard::new();
        sim.set_send_ready(false);
        let (board, mut rx) = sim_board(&sim);
        board.set_owner("ext-A");

        let driver = {
            let sim = sim.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                sim.emit(Signal::Error("framing error".into()));
            }
        };
        let (result, ()) = tokio::join!(board.connect(), driver);
        assert_eq!(
            result,
            Err(BoardError::UnexpectedDisconnect("framing error".into()))
        );
        assert_eq!(board.state(), ConnectionState::Disconnected);
        assert!(matches!(
            rx.try_recv().unwrap(),
            HostEvent::PeripheralConnectionLostError { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn release_emits_once() {
        let sim = SimBoard::new();
        let (board, _rx) = ready_board(&sim).await;
        let mut events = board.subscribe();

        for _ in 0..3 {
            board.release();
            assert_eq!(board.state(), ConnectionState::Disconnected);
        }
        assert_eq!(events.try_recv().unwrap(), BoardEvent::Released);
        assert!(events.try_recv().is_err());
        assert_eq!(board.owner_id(), None);
        assert_eq!(sim.stats().closes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_resets_the_device() {
        let sim = SimBoard::new();
        let (board, mut rx) = ready_board(&sim).await;
        board.disconnect();
        board.disconnect();
        assert_eq!(sim.stats().resets, 1);
        assert_eq!(board.state(), ConnectionState::Disconnected);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn signals_from_a_replaced_transport_are_ignored() {
        let sim = SimBoard::new();
        let (board, mut rx) = ready_board(&sim).await;
        board.disconnect();
        board.connect().await.unwrap();
        assert_eq!(sim.attach_count(), 2);

        let generation = board.generation();
        sim.emit_via(0, Signal::Error("stale".into()));
        sim.emit_via(0, Signal::Close);
        sim.emit_via(0, Signal::Ready);
        assert_eq!(board.state(), ConnectionState::Ready);
        assert_eq!(board.generation(), generation);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn samples_from_a_replaced_transport_do_not_reach_pending_reads() {
        let sim = SimBoard::new();
        let (board, _rx) = ready_board(&sim).await;
        board.disconnect();
        board.connect().await.unwrap();
        sim.set_digital_input(4, true);
        sim.set_sample_delay(Duration::from_millis(30));

        let stale = {
            let sim = sim.clone();
            let board = board.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                sim.emit_via(0, Signal::DigitalSample { pin: 4, value: 0 });
                sim.emit_via(0, Signal::AnalogSample { channel: 0, value: 999 });

                let pin = board.pin(4).unwrap();
                assert!(pin.updating);
                assert_eq!(pin.value, 0);
                assert_eq!(pin.last_update, None);
                let a0 = board.pin(14).unwrap();
                assert_eq!(a0.value, 0);
                assert_eq!(a0.last_update, None);
            }
        };
        let (result, ()) = tokio::join!(board.read_digital(4), stale);

        assert_eq!(result, Ok(true));
        let pin = board.pin(4).unwrap();
        assert_eq!(pin.value, 1);
        assert!(pin.last_update.is_some());
        assert!(!pin.updating);
        assert_eq!(board.pin(14).unwrap().value, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn close_signal_releases_without_lost_notification() {
        let sim = SimBoard::new();
        let (board, mut rx) = ready_board(&sim).await;
        sim.emit(Signal::Close);
        assert_eq!(board.state(), ConnectionState::Disconnected);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_signal_notifies_host_once() {
        let sim = SimBoard::new();
        let (board, mut rx) = ready_board(&sim).await;
        sim.emit(Signal::Disconnect);
        sim.emit(Signal::Disconnect);
        assert_eq!(board.state(), ConnectionState::Disconnected);
        assert_eq!(
            rx.try_recv().unwrap(),
            HostEvent::PeripheralConnectionLostError {
                message: "device disconnected".into(),
                extension_id: "ext-A".into(),
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn back_to_back_reads_issue_one_request() {
        let sim = SimBoard::new();
        sim.set_digital_input(7, true);
        let (board, _rx) = ready_board(&sim).await;

        let first = board.read_digital(7).await.unwrap();
        let second = board.read_digital(7).await.unwrap();
        assert!(first);
        assert_eq!(first, second);
        assert_eq!(sim.stats().digital_reports, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn read_after_interval_samples_again() {
        let sim = SimBoard::new();
        let (board, _rx) = ready_board(&sim).await;

        assert!(!board.read_digital(7).await.unwrap());
        sim.set_digital_input(7, true);
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(board.read_digital(7).await.unwrap());
        assert_eq!(sim.stats().digital_reports, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_read_is_served_from_cache() {
        let sim = SimBoard::new();
        sim.set_digital_input(4, true);
        sim.set_sample_delay(Duration::from_millis(30));
        let (board, _rx) = ready_board(&sim).await;

        let (first, second) = tokio::join!(board.read_digital(4), board.read_digital(4));
        assert!(first.unwrap());
        assert!(!second.unwrap());
        assert_eq!(sim.stats().digital_reports, 1);
        assert!(!board.pin(4).unwrap().updating);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_pin_times_out_and_clears_state() {
        let sim = SimBoard::new();
        sim.set_digital_input(2, true);
        let (board, _rx) = ready_board(&sim).await;
        assert!(board.read_digital(2).await.unwrap());

        sim.set_answer_reports(false);
        tokio::time::sleep(Duration::from_millis(25)).await;
        let err = board.read_digital(2).await.unwrap_err();
        assert_eq!(
            err,
            BoardError::ReadTimeout {
                pin: 2,
                timeout: Duration::from_millis(100),
            }
        );
        let pin = board.pin(2).unwrap();
        assert_eq!(pin.value, 0);
        assert!(!pin.updating);
        assert_eq!(board.state(), ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn late_sample_after_timeout_is_discarded() {
        let sim = SimBoard::new();
        sim.set_digital_input(2, true);
        sim.set_sample_delay(Duration::from_millis(150));
        let (board, _rx) = ready_board(&sim).await;

        assert!(board.read_digital(2).await.is_err());
        tokio::time::sleep(Duration::from_millis(100)).await;
        let pin = board.pin(2).unwrap();
        assert_eq!(pin.value, 0);
        assert_eq!(pin.last_update, None);
    }

    #[tokio::test(start_paused = true)]
    async fn pins_in_output_functions_are_not_sampled() {
        let sim = SimBoard::new();
        let (board, _rx) = ready_board(&sim).await;
        board.write_pwm(3, 128).await.unwrap();
        board.write_digital(4, true, false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(!board.read_digital(3).await.unwrap());
        assert!(!board.read_digital(4).await.unwrap());
        assert_eq!(sim.stats().digital_reports, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reading_a_driven_output_keeps_it_driven() {
        let sim = SimBoard::new();
        let (board, _rx) = ready_board(&sim).await;
        board.write_digital(13, true, false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;

        assert!(!board.read_digital(13).await.unwrap());
        assert_eq!(sim.mode(13), Some(PinMode::Output));
        assert_eq!(sim.output(13), Some(HIGH));
        assert_eq!(board.pin(13).unwrap().mode, PinMode::Output);
        assert_eq!(sim.stats().digital_reports, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn analog_read_uses_channel_mapping() {
        let sim = SimBoard::new();
        sim.set_analog_input(2, 731);
        let (board, _rx) = ready_board(&sim).await;

        assert_eq!(board.read_analog(2).await.unwrap(), 731);
        assert_eq!(board.pin(16).unwrap().value, 731);
        assert_eq!(sim.mode(16), Some(PinMode::Analog));
        assert_eq!(board.read_analog(2).await.unwrap(), 731);
        assert_eq!(sim.stats().analog_reports, 1);
        assert_eq!(board.read_analog(9).await, Err(BoardError::InvalidPin(9)));
    }

    #[tokio::test(start_paused = true)]
    async fn release_during_read_fails_the_read() {
        let sim = SimBoard::new();
        sim.set_answer_reports(false);
        let (board, _rx) = ready_board(&sim).await;

        let releaser = {
            let board = board.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                board.release();
            }
        };
        let (result, ()) = tokio::join!(board.read_digital(5), releaser);
        assert_eq!(result, Err(BoardError::NotConnected));
        assert!(!board.pin(5).unwrap().updating);
    }

    #[tokio::test(start_paused = true)]
    async fn write_resolves_after_pacing_delay() {
        let sim = SimBoard::new();
        let (board, _rx) = ready_board(&sim).await;

        let start = Instant::now();
        board.write_digital(13, true, false).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(10));
        assert_eq!(sim.output(13), Some(HIGH));
        assert_eq!(sim.mode(13), Some(PinMode::Output));
        assert_eq!(board.pin(13).unwrap().value, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn servo_and_pwm_writes_switch_modes() {
        let sim = SimBoard::new();
        let (board, _rx) = ready_board(&sim).await;
        board.write_servo(9, 90).await.unwrap();
        board.write_pwm(10, 200).await.unwrap();
        assert_eq!(sim.mode(9), Some(PinMode::Servo));
        assert_eq!(sim.output(9), Some(90));
        assert_eq!(sim.mode(10), Some(PinMode::Pwm));
        assert_eq!(board.pin(10).unwrap().mode, PinMode::Pwm);
    }

    #[tokio::test(start_paused = true)]
    async fn input_bias_is_recorded_and_applied() {
        let sim = SimBoard::new();
        let (board, _rx) = ready_board(&sim).await;
        let start = Instant::now();
        board.set_input_bias(8, true).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(10));
        assert_eq!(board.pin(8).unwrap().input_bias, InputBias::PullUp);
        assert_eq!(sim.mode(8), Some(PinMode::Pullup));

        board.read_digital(8).await.unwrap();
        assert_eq!(sim.mode(8), Some(PinMode::Pullup));
    }

    #[tokio::test(start_paused = true)]
    async fn operations_on_a_disconnected_board_are_rejected() {
        let sim = SimBoard::new();
        let (board, _rx) = sim_board(&sim);
        assert_eq!(board.read_digital(2).await, Err(BoardError::NotConnected));
        assert_eq!(
            board.write_digital(2, true, false).await,
            Err(BoardError::NotConnected)
        );
        assert!(board.pins_supporting(PinMode::Input).is_empty());
        assert_eq!(sim.stats().writes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn write_to_a_dead_link_tears_the_board_down() {
        let sim = SimBoard::new();
        let (board, mut rx) = ready_board(&sim).await;
        let stale = board.clone();
        // Close the port behind the board's back.
        board.lock().link.as_ref().unwrap().transport.close().unwrap();

        stale.write_digital(13, true, false).await.unwrap();
        assert_eq!(board.state(), ConnectionState::Disconnected);
        assert!(matches!(
            rx.try_recv().unwrap(),
            HostEvent::PeripheralConnectionLostError { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn enumeration_lists_capable_pins() {
        let sim = SimBoard::new();
        let (board, _rx) = ready_board(&sim).await;
        assert_eq!(board.pins_supporting(PinMode::Pwm), vec![3, 5, 6, 9, 10, 11]);
        assert_eq!(board.pins_supporting(PinMode::Input), (0..14).collect::<Vec<u8>>());
        assert_eq!(board.pins_supporting(PinMode::Servo).len(), 12);
    }
}
