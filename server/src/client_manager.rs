//! Connected clients and their lobby subscriptions.
//!
//! A client is identified by the address its datagrams come from. Each one
//! carries the user id it announced on connect and the set of lobbies it
//! wants updates for. Clients that stay silent past the timeout are dropped.

use log::info;
use shared::{LobbyId, UserId};
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Client {
    /// Session id assigned by the coordinator
    pub id: u32,
    pub addr: SocketAddr,
    /// User the client announced on connect
    pub user_id: UserId,
    /// Last time we received any packet from this client
    pub last_seen: Instant,
    /// Lobbies this client receives snapshots for
    pub subscriptions: BTreeSet<LobbyId>,
}

impl Client {
    /// Creates a client with no subscriptions, marked as just seen
    pub fn new(id: u32, addr: SocketAddr, user_id: UserId) -> Self {
        Self {
            id,
            addr,
            user_id,
            last_seen: Instant::now(),
            subscriptions: BTreeSet::new(),
        }
    }

    /// True when nothing has arrived from this client within `timeout`
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Table of connected clients
///
/// Enforces the capacity limit and tracks which lobbies each client
/// watches, so the network loop can fan lobby snapshots out to the right
/// addresses.
pub struct ClientManager {
    clients: HashMap<u32, Client>,
    /// Session ids are never reused
    next_client_id: u32,
    max_clients: usize,
    timeout: Duration,
}

impl ClientManager {
    /// Creates an empty table
    ///
    /// `timeout` is how long a client may stay silent before
    /// [`check_timeouts`](Self::check_timeouts) drops it.
    pub fn new(max_clients: usize, timeout: Duration) -> Self {
        Self {
            clients: HashMap::new(),
            next_client_id: 1,
            max_clients,
            timeout,
        }
    }

    /// Returns the new session id, or `None` when the coordinator is full.
    pub fn add_client(&mut self, addr: SocketAddr, user_id: UserId) -> Option<u32> {
        if self.clients.len() >= self.max_clients {
            return None;
        }

        let client_id = self.next_client_id;
        self.next_client_id += 1;

        info!(
            "Client {} (user {}) connected from {}",
            client_id, user_id, addr
        );
        self.clients
            .insert(client_id, Client::new(client_id, addr, user_id));
        Some(client_id)
    }

    /// Drops a client and its subscriptions; false if it was unknown.
    pub fn remove_client(&mut self, client_id: &u32) -> bool {
        if let Some(client) = self.clients.remove(client_id) {
            info!("Client {} disconnected", client.id);
            true
        } else {
            false
        }
    }

    /// Session id of the client sending from `addr`, if any
    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<u32> {
        self.clients
            .iter()
            .find(|(_, client)| client.addr == addr)
            .map(|(id, _)| *id)
    }

    /// Marks the client as alive and returns the user behind it.
    pub fn touch(&mut self, client_id: u32) -> Option<UserId> {
        let client = self.clients.get_mut(&client_id)?;
        client.last_seen = Instant::now();
        Some(client.user_id)
    }

    /// Starts sending `lobby` snapshots to the client
    ///
    /// Returns false for an unknown session id.
    pub fn subscribe(&mut self, client_id: u32, lobby: LobbyId) -> bool {
        match self.clients.get_mut(&client_id) {
            Some(client) => {
                client.subscriptions.insert(lobby);
                true
            }
            None => false,
        }
    }

    /// Stops sending `lobby` snapshots to the client
    pub fn unsubscribe(&mut self, client_id: u32, lobby: LobbyId) {
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.subscriptions.remove(&lobby);
        }
    }

    /// Addresses of every client watching `lobby`.
    pub fn subscribers(&self, lobby: LobbyId) -> Vec<(u32, SocketAddr)> {
        self.clients
            .values()
            .filter(|client| client.subscriptions.contains(&lobby))
            .map(|client| (client.id, client.addr))
            .collect()
    }

    /// Lobbies with at least one subscriber.
    pub fn watched_lobbies(&self) -> BTreeSet<LobbyId> {
        self.clients
            .values()
            .flat_map(|client| client.subscriptions.iter().copied())
            .collect()
    }

    /// Removes clients that have been silent longer than the timeout.
    pub fn check_timeouts(&mut self) -> Vec<u32> {
        let timeout = self.timeout;
        let timed_out: Vec<u32> = self
            .clients
            .iter()
            .filter(|(_, client)| client.is_timed_out(timeout))
            .map(|(id, _)| *id)
            .collect();

        for client_id in &timed_out {
            self.remove_client(client_id);
        }

        timed_out
    }

    /// Session id and address of every connected client
    pub fn get_client_addrs(&self) -> Vec<(u32, SocketAddr)> {
        self.clients
            .iter()
            .map(|(id, client)| (*id, client.addr))
            .collect()
    }

    /// Number of connected clients
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    fn test_addr2() -> SocketAddr {
        "127.0.0.1:8081".parse().unwrap()
    }

    fn manager(max_clients: usize) -> ClientManager {
        ClientManager::new(max_clients, Duration::from_secs(30))
    }

    #[test]
    fn test_client_timeout() {
        let mut client = Client::new(1, test_addr(), 7);
        assert!(!client.is_timed_out(Duration::from_secs(1)));

        client.last_seen = Instant::now() - Duration::from_secs(2);
        assert!(client.is_timed_out(Duration::from_secs(1)));
    }

    #[test]
    fn test_add_client_max_capacity() {
        let mut manager = manager(1);

        assert_eq!(manager.add_client(test_addr(), 7), Some(1));
        assert_eq!(manager.add_client(test_addr2(), 8), None);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_remove_client() {
        let mut manager = manager(2);
        let client_id = manager.add_client(test_addr(), 7).unwrap();

        assert!(manager.remove_client(&client_id));
        assert!(!manager.remove_client(&client_id));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_find_client_by_addr() {
        let mut manager = manager(2);
        let client_id1 = manager.add_client(test_addr(), 7).unwrap();
        manager.add_client(test_addr2(), 8).unwrap();

        assert_eq!(manager.find_client_by_addr(test_addr()), Some(client_id1));
        let unknown: SocketAddr = "192.168.1.1:9999".parse().unwrap();
        assert_eq!(manager.find_client_by_addr(unknown), None);
    }

    #[test]
    fn test_touch_returns_user() {
        let mut manager = manager(2);
        let client_id = manager.add_client(test_addr(), 42).unwrap();
        assert_eq!(manager.touch(client_id), Some(42));
        assert_eq!(manager.touch(999), None);
    }

    #[test]
    fn test_subscriptions() {
        let mut manager = manager(3);
        let a = manager.add_client(test_addr(), 1).unwrap();
        let b = manager.add_client(test_addr2(), 2).unwrap();

        assert!(manager.subscribe(a, 10));
        assert!(manager.subscribe(b, 10));
        assert!(manager.subscribe(b, 11));
        assert!(!manager.subscribe(999, 10));

        let mut watching = manager.subscribers(10);
        watching.sort();
        assert_eq!(watching, vec![(a, test_addr()), (b, test_addr2())]);
        assert_eq!(manager.watched_lobbies(), BTreeSet::from([10, 11]));

        manager.unsubscribe(b, 10);
        assert_eq!(manager.subscribers(10), vec![(a, test_addr())]);
    }

    #[test]
    fn test_check_timeouts_removes_silent_clients() {
        let mut manager = ClientManager::new(3, Duration::from_secs(30));
        let quiet = manager.add_client(test_addr(), 1).unwrap();
        let chatty = manager.add_client(test_addr2(), 2).unwrap();
        manager.clients.get_mut(&quiet).unwrap().last_seen =
            Instant::now() - Duration::from_secs(31);

        assert_eq!(manager.check_timeouts(), vec![quiet]);
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.find_client_by_addr(test_addr2()), Some(chatty));
    }
}
