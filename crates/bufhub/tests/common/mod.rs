//! A real server on a background thread, with a unique region and socket.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bufhub::{Client, HubConfig, MemfdAllocator, Server, ServerHandle};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct TestHub {
    pub config: HubConfig,
    handle: ServerHandle,
    thread: Option<JoinHandle<()>>,
}

impl TestHub {
    pub fn start(slot_count: u32) -> Self {
        Self::start_with(|config| config.slot_count = slot_count)
    }

    pub fn start_with(tweak: impl FnOnce(&mut HubConfig)) -> Self {
        init_tracing();
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let tag = format!(
            "{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        );

        let mut config = HubConfig {
            region_name: format!("/bufhub-test-{}", tag),
            socket_path: std::env::temp_dir().join(format!("bufhub-test-{}.sock", tag)),
            poll_interval: Duration::from_millis(10),
            handshake_timeout: Duration::from_secs(2),
            ..HubConfig::default()
        };
        tweak(&mut config);

        let (tx, rx) = std::sync::mpsc::channel();
        let server_config = config.clone();
        let thread = std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async move {
                let server = Server::bind(server_config, Arc::new(MemfdAllocator)).unwrap();
                tx.send(server.handle()).unwrap();
                server.run().await.unwrap();
            });
        });
        let handle = rx.recv().expect("server failed to start");

        Self {
            config,
            handle,
            thread: Some(thread),
        }
    }

    pub fn connect(&self) -> Client {
        Client::connect(&self.config).unwrap()
    }

    /// Stop the server and wait for it to exit.
    pub fn stop(&mut self) {
        self.handle.shutdown();
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

impl Drop for TestHub {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}
