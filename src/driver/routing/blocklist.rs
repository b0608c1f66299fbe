//! Host Blocklist
//!
//! 호스트 블록리스트
//! 장애 호스트를 일정 시간 선택에서 제외합니다. 만료된 항목은 조회 시 제거되고, 타임아웃 0은 해제 전까지 유지됩니다.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use super::super::driver::ServerAddress;

/// 블록리스트 항목 (운영자 조회용)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlocklistEntry {
    /// 제외된 호스트
    pub host: ServerAddress,
    /// 만료 시각 (`None`이면 해제 전까지 유지)
    pub expires_at: Option<DateTime<Utc>>,
}

/// 블록리스트
#[derive(Debug, Default)]
pub struct Blocklist {
    entries: Mutex<HashMap<ServerAddress, Option<Instant>>>,
}

impl Blocklist {
    /// 새 블록리스트 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// `timeout` 동안 `host` 제외 (0이면 해제 전까지)
    ///
    /// 다시 추가하면 만료 시각이 갱신됩니다.
    pub fn add(&self, host: &ServerAddress, timeout: Duration) {
        let expiry = if timeout.is_zero() {
            None
        } else {
            Some(Instant::now() + timeout)
        };
        self.entries.lock().insert(host.clone(), expiry);
    }

    /// `host` 제외 여부 (만료 항목은 제거)
    pub fn contains(&self, host: &ServerAddress) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(host) {
            Some(Some(expiry)) if *expiry <= Instant::now() => {
                entries.remove(host);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// `host` 항목 제거
    pub fn clear(&self, host: &ServerAddress) -> bool {
        self.entries.lock().remove(host).is_some()
    }

    /// 전체 제거
    pub fn clear_all(&self) {
        self.entries.lock().clear();
    }

    /// 제외 중인 호스트
    pub fn hosts(&self) -> Vec<ServerAddress> {
        let mut entries = self.entries.lock();
        prune(&mut entries);
        let mut hosts: Vec<ServerAddress> = entries.keys().cloned().collect();
        hosts.sort();
        hosts
    }

    /// 제외 중인 항목 (만료 시각 포함)
    pub fn entries(&self) -> Vec<BlocklistEntry> {
        let mut entries = self.entries.lock();
        prune(&mut entries);

        let now = Instant::now();
        let wall_now = Utc::now();
        let mut out: Vec<BlocklistEntry> = entries
            .iter()
            .map(|(host, expiry)| BlocklistEntry {
                host: host.clone(),
                expires_at: expiry.and_then(|at| {
                    chrono::Duration::from_std(at.saturating_duration_since(now))
                        .ok()
                        .map(|remaining| wall_now + remaining)
                }),
            })
            .collect();
        out.sort_by(|a, b| a.host.cmp(&b.host));
        out
    }

    /// 항목 수
    pub fn len(&self) -> usize {
        let mut entries = self.entries.lock();
        prune(&mut entries);
        entries.len()
    }

    /// 비어 있음 여부
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn prune(entries: &mut HashMap<ServerAddress, Option<Instant>>) {
    let now = Instant::now();
    entries.retain(|_, expiry| expiry.map_or(true, |at| at > now));
}

/// 로컬/전역 블록리스트 통합 뷰
///
/// 어느 한쪽에라도 유효한 항목이 있으면 제외됩니다.
#[derive(Debug, Clone, Copy)]
pub struct BlocklistView<'a> {
    local: &'a Blocklist,
    global: Option<&'a Blocklist>,
}

impl<'a> BlocklistView<'a> {
    /// 새 뷰 생성
    pub fn new(local: &'a Blocklist, global: Option<&'a Blocklist>) -> Self {
        Self { local, global }
    }

    /// `host` 제외 여부
    pub fn is_excluded(&self, host: &ServerAddress) -> bool {
        // 양쪽 모두 평가 (만료 항목 제거)
        let local = self.local.contains(host);
        let global = self.global.map_or(false, |g| g.contains(host));
        local || global
    }

    /// `candidates` 중 제외된 호스트
    pub fn excluded(&self, candidates: &[ServerAddress]) -> HashSet<ServerAddress> {
        candidates
            .iter()
            .filter(|h| self.is_excluded(h))
            .cloned()
            .collect()
    }

    /// 양쪽에 `host` 등록
    pub fn add(&self, host: &ServerAddress, timeout: Duration) {
        self.local.add(host, timeout);
        if let Some(global) = self.global {
            global.add(host, timeout);
        }
    }

    /// 양쪽에서 `host` 제거
    pub fn clear(&self, host: &ServerAddress) {
        self.local.clear(host);
        if let Some(global) = self.global {
            global.clear(host);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn addr(host: &str) -> ServerAddress {
        ServerAddress::new(host, 3306)
    }

    #[test]
    fn test_blocklist_add_and_clear() {
        let list = Blocklist::new();
        assert!(!list.contains(&addr("a")));

        list.add(&addr("a"), Duration::ZERO);
        assert!(list.contains(&addr("a")));
        assert_eq!(list.len(), 1);

        assert!(list.clear(&addr("a")));
        assert!(!list.clear(&addr("a")));
        assert!(list.is_empty());
    }

    #[test]
    fn test_blocklist_lazy_expiry() {
        let list = Blocklist::new();
        list.add(&addr("a"), Duration::from_millis(20));
        list.add(&addr("b"), Duration::ZERO);
        assert!(list.contains(&addr("a")));

        thread::sleep(Duration::from_millis(40));

        assert!(!list.contains(&addr("a")));
        assert!(list.contains(&addr("b")));
        assert_eq!(list.hosts(), vec![addr("b")]);
    }

    #[test]
    fn test_blocklist_entries_report_expiry() {
        let list = Blocklist::new();
        list.add(&addr("a"), Duration::from_secs(60));
        list.add(&addr("b"), Duration::ZERO);

        let entries = list.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].host, addr("a"));
        assert!(entries[0].expires_at.unwrap() > Utc::now());
        assert!(entries[1].expires_at.is_none());
    }

    #[test]
    fn test_view_most_restrictive_wins() {
        let local = Blocklist::new();
        let global = Blocklist::new();
        let view = BlocklistView::new(&local, Some(&global));

        // 로컬은 만료, 전역은 유효
        local.add(&addr("a"), Duration::from_millis(1));
        global.add(&addr("a"), Duration::from_secs(60));
        thread::sleep(Duration::from_millis(10));
        assert!(view.is_excluded(&addr("a")));

        // 로컬만 유효
        local.add(&addr("b"), Duration::ZERO);
        assert!(view.is_excluded(&addr("b")));
        assert!(!global.contains(&addr("b")));

        let excluded = view.excluded(&[addr("a"), addr("b"), addr("c")]);
        assert_eq!(excluded.len(), 2);
        assert!(!excluded.contains(&addr("c")));
    }

    #[test]
    fn test_view_add_and_clear_reach_both_lists() {
        let local = Blocklist::new();
        let global = Blocklist::new();
        let view = BlocklistView::new(&local, Some(&global));

        view.add(&addr("a"), Duration::ZERO);
        assert!(local.contains(&addr("a")));
        assert!(global.contains(&addr("a")));

        view.clear(&addr("a"));
        assert!(!view.is_excluded(&addr("a")));

        let local_only = BlocklistView::new(&local, None);
        local_only.add(&addr("b"), Duration::ZERO);
        assert!(!global.contains(&addr("b")));
    }
}
