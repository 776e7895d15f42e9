//! A bounded pool of reusable HTTP clients.
//!
//! Short platform requests (describe, file-new, close) check a client out
//! of the pool and return it when done. Acquisition blocks when all
//! clients are out; release happens on drop, so every exit path returns
//! the client.

use std::ops::Deref;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::Mutex;

/// Request timeout for short platform calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Fixed-size pool of reqwest clients.
pub struct ClientPool {
    tx: mpsc::Sender<reqwest::Client>,
    rx: Mutex<mpsc::Receiver<reqwest::Client>>,
}

impl ClientPool {
    /// Build a pool with `size` clients.
    pub fn new(size: usize) -> ClientPool {
        let (tx, rx) = mpsc::channel(size.max(1));
        for _ in 0..size.max(1) {
            let client: reqwest::Client = reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new());
            // The channel has exactly `size` slots; this cannot fail.
            let _ = tx.try_send(client);
        }
        ClientPool {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Check a client out of the pool, waiting for one to come back if
    /// all are in use.
    pub async fn acquire(&self) -> PooledClient {
        let client: reqwest::Client = {
            let mut rx = self.rx.lock().await;
            match rx.recv().await {
                Some(c) => c,
                // The sender side lives as long as the pool, so the
                // channel cannot close; fall back to a fresh client.
                None => reqwest::Client::new(),
            }
        };
        PooledClient {
            client: Some(client),
            tx: self.tx.clone(),
        }
    }
}

/// A checked-out client; returns itself to the pool on drop.
pub struct PooledClient {
    client: Option<reqwest::Client>,
    tx: mpsc::Sender<reqwest::Client>,
}

impl Deref for PooledClient {
    type Target = reqwest::Client;

    fn deref(&self) -> &reqwest::Client {
        // `client` is only None after drop.
        self.client.as_ref().unwrap()
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            let _ = self.tx.try_send(client);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_release_cycle() {
        let pool = ClientPool::new(2);
        let a = pool.acquire().await;
        let b = pool.acquire().await;
        drop(a);
        // A third acquire succeeds because the first client came back.
        let c = pool.acquire().await;
        drop(b);
        drop(c);
    }

    #[tokio::test]
    async fn test_acquisition_blocks_until_release() {
        let pool = std::sync::Arc::new(ClientPool::new(1));
        let held = pool.acquire().await;

        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move {
            let _c = pool2.acquire().await;
        });

        // The waiter cannot finish while the only client is held.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await.unwrap();
    }
}
