//! Host Health Prober
//!
//! 호스트 상태 검사기
//! (전역 블록리스트 호스트에 주기적으로 재연결하고, 응답하면 블록리스트에서 제거)

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use super::physical::{ConnectContext, Connector};
use super::routing::Blocklist;

#[derive(Debug, Default)]
struct Shutdown {
    stopped: Mutex<bool>,
    wakeup: Condvar,
}

/// 공유 블록리스트 백그라운드 검사기
pub struct HostProber {
    shutdown: Arc<Shutdown>,
    handle: Option<JoinHandle<()>>,
}

impl HostProber {
    /// `interval`마다 `blocklist` 검사 시작
    pub fn start(
        blocklist: Arc<Blocklist>,
        connector: Arc<dyn Connector>,
        ctx: ConnectContext,
        interval: Duration,
    ) -> Self {
        let shutdown = Arc::new(Shutdown::default());
        let worker_shutdown = shutdown.clone();

        let handle = thread::spawn(move || {
            debug!(?interval, "host prober started");
            loop {
                {
                    let mut stopped = worker_shutdown.stopped.lock();
                    if !*stopped {
                        worker_shutdown.wakeup.wait_for(&mut stopped, interval);
                    }
                    if *stopped {
                        break;
                    }
                }
                probe_once(&blocklist, connector.as_ref(), &ctx);
            }
            debug!("host prober stopped");
        });

        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    /// 검사 중지 (스레드 종료 대기)
    pub fn stop(&mut self) {
        *self.shutdown.stopped.lock() = true;
        self.shutdown.wakeup.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    /// 실행 중 여부
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for HostProber {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for HostProber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostProber")
            .field("running", &self.is_running())
            .finish()
    }
}

/// 블록리스트 호스트를 한 번씩 검사 (복귀한 호스트 수 반환)
pub fn probe_once(blocklist: &Blocklist, connector: &dyn Connector, ctx: &ConnectContext) -> usize {
    let mut readmitted = 0;
    for host in blocklist.hosts() {
        match connector.open(&host, ctx) {
            Ok(mut conn) => {
                conn.close();
                if blocklist.clear(&host) {
                    info!(%host, "host answered probe; removed from blocklist");
                    readmitted += 1;
                }
            }
            Err(e) => debug!(%host, error = %e, "host still unreachable"),
        }
    }
    readmitted
}
