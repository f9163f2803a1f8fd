//! Boards shared by the command producers of one host session.

use boardlink_hal::config::BoardConfig;
use boardlink_hal::traits::{PortProvider, ProtocolFactory};
use boardlink_hal::types::PortFilter;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::broadcast;

use crate::board::{Board, BoardId};
use crate::error::BoardError;
use crate::events::{HostEvent, HostNotifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryEvent {
    BoardAdded(BoardId),
    BoardRemoved(BoardId),
}

struct RegistryInner {
    name: String,
    boards: Mutex<Vec<Board>>,
    events: broadcast::Sender<RegistryEvent>,
    config: BoardConfig,
    ports: Arc<dyn PortProvider>,
    protocol: Arc<dyn ProtocolFactory>,
    host: HostNotifier,
}

/// Insertion-ordered set of live boards. Clones share the same set.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    pub fn new(
        config: BoardConfig,
        ports: Arc<dyn PortProvider>,
        protocol: Arc<dyn ProtocolFactory>,
        host: HostNotifier,
    ) -> Self {
        Self::named("board", config, ports, protocol, host)
    }

    /// A registry whose boards are announced to the host as `name` when
    /// their firmware does not identify itself.
    pub fn named(
        name: &str,
        config: BoardConfig,
        ports: Arc<dyn PortProvider>,
        protocol: Arc<dyn ProtocolFactory>,
        host: HostNotifier,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(RegistryInner {
                name: name.to_string(),
                boards: Mutex::new(Vec::new()),
                events,
                config,
                ports,
                protocol,
                host,
            }),
        }
    }

    fn boards_mut(&self) -> MutexGuard<'_, Vec<Board>> {
        self.inner
            .boards
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.events.subscribe()
    }

    pub fn peripheral_name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &BoardConfig {
        &self.inner.config
    }

    pub fn len(&self) -> usize {
        self.boards_mut().len()
    }

    pub fn is_empty(&self) -> bool {
        self.boards_mut().is_empty()
    }

    pub fn boards(&self) -> Vec<Board> {
        self.boards_mut().clone()
    }

    pub fn contains(&self, id: BoardId) -> bool {
        self.boards_mut().iter().any(|b| b.id() == id)
    }

    /// Without filters: the first board added. With filters: the first
    /// connected board whose descriptor matches any of them.
    pub fn find(&self, filters: Option<&[PortFilter]>) -> Option<Board> {
        let boards = self.boards_mut();
        match filters {
            None => boards.first().cloned(),
            Some(filters) => boards
                .iter()
                .find(|board| {
                    board.is_connected()
                        && board
                            .descriptor()
                            .is_some_and(|desc| desc.matches_any(filters))
                })
                .cloned(),
        }
    }

    pub fn add(&self, board: Board) {
        let id = board.id();
        {
            let mut boards = self.boards_mut();
            if boards.iter().any(|b| b.id() == id) {
                return;
            }
            boards.push(board);
        }
        log::debug!("registry: added board {id}");
        let _ = self.inner.events.send(RegistryEvent::BoardAdded(id));
    }

    /// Returns false when the board was not registered.
    pub fn remove(&self, id: BoardId) -> bool {
        let removed = {
            let mut boards = self.boards_mut();
            let before = boards.len();
            boards.retain(|b| b.id() != id);
            boards.len() != before
        };
        if removed {
            log::debug!("registry: removed board {id}");
            let _ = self.inner.events.send(RegistryEvent::BoardRemoved(id));
        }
        removed
    }

    /// Hand out a usable board, connecting a new one if none is registered.
    ///
    /// A board becomes visible to `find` only once it has connected, so two
    /// producers acquiring concurrently while the first connect is still in
    /// flight each open their own transport; on real hardware the second
    /// open is refused.
    pub async fn acquire(&self, owner_id: &str) -> Result<Board, BoardError> {
        if let Some(board) = self.find(None) {
            log::debug!("registry: {owner_id} reuses board {}", board.id());
            return Ok(board);
        }

        let board = Board::new(
            self.inner.config.clone(),
            self.inner.ports.clone(),
            self.inner.protocol.clone(),
            self.inner.host.clone(),
        );
        board.set_owner(owner_id);
        board.connect().await?;

        let name = board
            .firmware()
            .map(|f| f.name)
            .unwrap_or_else(|| self.inner.name.clone());
        let path = board
            .descriptor()
            .map(|desc| desc.path)
            .unwrap_or_default();
        self.add(board.clone());

        let registry = Arc::downgrade(&self.inner);
        let (hook_name, hook_path) = (name.clone(), path.clone());
        let hooked = board.on_release(Box::new(move |board: &Board| {
            forget(&registry, board.id(), hook_name, hook_path);
        }));
        if !hooked {
            self.remove(board.id());
            return Err(BoardError::UnexpectedDisconnect(
                "board was released while being registered".to_string(),
            ));
        }

        log::info!("registry: {owner_id} connected to {name} at {path}");
        self.inner
            .host
            .notify(HostEvent::PeripheralConnected { name, path });
        Ok(board)
    }
}

fn forget(registry: &Weak<RegistryInner>, id: BoardId, name: String, path: String) {
    let Some(inner) = registry.upgrade() else {
        return;
    };
    let registry = Registry { inner };
    if registry.remove(id) {
        registry
            .inner
            .host
            .notify(HostEvent::PeripheralDisconnected { name, path });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::ConnectionState;
    use boardlink_hal::sim::{SIM_PRODUCT_ID, SIM_VENDOR_ID, SimBoard};
    use boardlink_hal::traits::Signal;
    use boardlink_hal::types::PortDescriptor;
    use tokio::sync::mpsc;

    fn registry(sim: &SimBoard) -> (Registry, mpsc::UnboundedReceiver<HostEvent>) {
        let (host, rx) = HostNotifier::channel();
        let registry = Registry::new(
            BoardConfig::default(),
            Arc::new(sim.clone()),
            Arc::new(sim.clone()),
            host,
        );
        (registry, rx)
    }

    const SIM_FILTER: PortFilter = PortFilter {
        usb_vendor_id: SIM_VENDOR_ID,
        usb_product_id: SIM_PRODUCT_ID,
    };

    #[tokio::test(start_paused = true)]
    async fn find_on_empty_registry_is_none() {
        let (registry, _rx) = registry(&SimBoard::new());
        assert!(registry.find(None).is_none());
        assert!(registry.find(Some(&[SIM_FILTER])).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn find_by_filter_returns_the_matching_board() {
        let sim = SimBoard::new();
        let (registry, _rx) = registry(&sim);
        let board = registry.acquire("ext-A").await.unwrap();

        let found = registry.find(Some(&[SIM_FILTER])).unwrap();
        assert_eq!(found.id(), board.id());

        let other = PortFilter {
            usb_vendor_id: 0x2341,
            usb_product_id: 0x0043,
        };
        assert!(registry.find(Some(&[other])).is_none());
        assert!(registry.find(Some(&[other, SIM_FILTER])).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn find_prefers_insertion_order() {
        let first_sim = SimBoard::new();
        let second_sim = SimBoard::with_descriptor(PortDescriptor {
            usb_vendor_id: Some(SIM_VENDOR_ID),
            usb_product_id: Some(SIM_PRODUCT_ID),
            path: "sim://board1".to_string(),
        });
        let (registry, _rx) = registry(&first_sim);
        let (host, _rx2) = HostNotifier::channel();

        let first = registry.acquire("ext-A").await.unwrap();
        let second = Board::new(
            BoardConfig::default(),
            Arc::new(second_sim.clone()),
            Arc::new(second_sim),
            host,
        );
        second.connect().await.unwrap();
        registry.add(second.clone());

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.find(None).unwrap().id(), first.id());
        assert_eq!(registry.find(Some(&[SIM_FILTER])).unwrap().id(), first.id());

        first.release();
        assert_eq!(registry.find(Some(&[SIM_FILTER])).unwrap().id(), second.id());
    }

    #[tokio::test(start_paused = true)]
    async fn second_producer_shares_the_first_board() {
        let sim = SimBoard::new();
        let (registry, mut rx) = registry(&sim);
        let mut events = registry.subscribe();

        let b1 = registry.acquire("ext-A").await.unwrap();
        assert_eq!(b1.descriptor().unwrap().usb_vendor_id, Some(0x04D8));
        assert_eq!(b1.descriptor().unwrap().usb_product_id, Some(0xE83A));
        let again = registry.acquire("ext-B").await.unwrap();

        assert_eq!(again.id(), b1.id());
        assert_eq!(sim.stats().opens, 1);
        assert_eq!(b1.owner_id().as_deref(), Some("ext-A"));
        assert_eq!(events.try_recv().unwrap(), RegistryEvent::BoardAdded(b1.id()));
        assert_eq!(
            rx.try_recv().unwrap(),
            HostEvent::PeripheralConnected {
                name: "StandardFirmata.ino".into(),
                path: "sim://board0".into(),
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn error_signal_removes_board_and_reports_loss_once() {
        let sim = SimBoard::new();
        let (registry, mut rx) = registry(&sim);
        let b1 = registry.acquire("ext-A").await.unwrap();
        let _ = rx.try_recv();
        let mut events = registry.subscribe();

        sim.emit(Signal::Error("usb reset".into()));
        assert_eq!(b1.state(), ConnectionState::Disconnected);
        assert!(!registry.contains(b1.id()));
        assert_eq!(events.try_recv().unwrap(), RegistryEvent::BoardRemoved(b1.id()));

        assert_eq!(
            rx.try_recv().unwrap(),
            HostEvent::PeripheralConnectionLostError {
                message: "usb reset".into(),
                extension_id: "ext-A".into(),
            }
        );
        assert!(matches!(
            rx.try_recv().unwrap(),
            HostEvent::PeripheralDisconnected { .. }
        ));
        assert!(rx.try_recv().is_err());

        b1.release();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_acquire_adds_nothing() {
        let sim = SimBoard::new();
        sim.set_send_ready(false);
        let (registry, mut rx) = registry(&sim);
        let err = registry.acquire("ext-A").await.unwrap_err();
        assert!(matches!(err, BoardError::HandshakeTimeout(_)));
        assert!(registry.is_empty());
        assert!(rx.try_recv().is_err());
        assert!(!sim.is_transport_open());
    }

    #[tokio::test(start_paused = true)]
    async fn reacquire_after_release_opens_a_new_board() {
        let sim = SimBoard::new();
        let (registry, _rx) = registry(&sim);
        let b1 = registry.acquire("ext-A").await.unwrap();
        b1.disconnect();
        assert!(registry.is_empty());

        let b2 = registry.acquire("ext-B").await.unwrap();
        assert_ne!(b1.id(), b2.id());
        assert_eq!(sim.stats().opens, 2);
        assert_eq!(b2.owner_id().as_deref(), Some("ext-B"));
    }

    #[tokio::test(start_paused = true)]
    async fn unidentified_firmware_is_announced_by_registry_name() {
        let sim = SimBoard::new();
        sim.set_firmware(None);
        let (host, mut rx) = HostNotifier::channel();
        let registry = Registry::named(
            "Bench board",
            BoardConfig::default(),
            Arc::new(sim.clone()),
            Arc::new(sim.clone()),
            host,
        );
        assert_eq!(registry.peripheral_name(), "Bench board");

        let board = registry.acquire("ext-A").await.unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            HostEvent::PeripheralConnected {
                name: "Bench board".into(),
                path: "sim://board0".into(),
            }
        );
        board.disconnect();
        assert_eq!(
            rx.try_recv().unwrap(),
            HostEvent::PeripheralDisconnected {
                name: "Bench board".into(),
                path: "sim://board0".into(),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn removing_an_absent_board_is_a_no_op() {
        let sim = SimBoard::new();
        let (registry, _rx) = registry(&sim);
        let mut events = registry.subscribe();
        assert!(!registry.remove(42));
        assert!(events.try_recv().is_err());
    }
}
