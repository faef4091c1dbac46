//! Per-session command job history.
//!
//! Jobs are the second half of the dual storage scheme: every command
//! appends to the session's continuous buffer AND creates a job record
//! here. The two lifetimes are independent — buffer trims never touch jobs
//! and job eviction never rewrites the buffer.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use gns_proto::{Job, JobStatus};

/// FIFO-capped job list, oldest first.
#[derive(Debug)]
pub struct JobStore {
    jobs: VecDeque<Job>,
    cap: usize,
}

impl JobStore {
    pub fn new(cap: usize) -> Self {
        Self {
            jobs: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    /// Insert a new job, evicting the oldest when the cap is exceeded.
    pub fn push(&mut self, job: Job) {
        self.jobs.push_back(job);
        while self.jobs.len() > self.cap {
            self.jobs.pop_front();
        }
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.jobs.iter().find(|j| j.id == id).cloned()
    }

    /// Mutate a job in place; true when it was found (and not yet evicted).
    pub fn update(&mut self, id: &str, apply: impl FnOnce(&mut Job)) -> bool {
        match self.jobs.iter_mut().find(|j| j.id == id) {
            Some(job) => {
                apply(job);
                true
            }
            None => false,
        }
    }

    /// Chronological history, filtered then truncated to the last `limit`.
    pub fn history(
        &self,
        limit: Option<usize>,
        search: Option<&str>,
        since: Option<DateTime<Utc>>,
    ) -> Vec<Job> {
        let filtered: Vec<Job> = self
            .jobs
            .iter()
            .filter(|j| search.is_none_or(|s| j.command.contains(s)))
            .filter(|j| since.is_none_or(|t| j.started_at >= t))
            .cloned()
            .collect();
        match limit {
            Some(n) => {
                let start = filtered.len().saturating_sub(n);
                filtered[start..].to_vec()
            }
            None => filtered,
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn running_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| j.status == JobStatus::Running)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn job(id: &str, command: &str, started_at: DateTime<Utc>) -> Job {
        Job {
            id: id.to_string(),
            command: command.to_string(),
            started_at,
            finished_at: None,
            status: JobStatus::Running,
            output: String::new(),
            error: None,
            execution_time: 0.0,
        }
    }

    #[test]
    fn test_cap_evicts_oldest_keeps_order() {
        let mut store = JobStore::new(3);
        let t = Utc::now();
        for i in 0..5 {
            store.push(job(&format!("j-{i}"), "show version", t));
        }
        assert_eq!(store.len(), 3);
        let ids: Vec<_> = store.history(None, None, None).iter().map(|j| j.id.clone()).collect();
        assert_eq!(ids, vec!["j-2", "j-3", "j-4"]);
        assert!(store.get("j-0").is_none());
    }

    #[test]
    fn test_update_transitions_job() {
        let mut store = JobStore::new(10);
        let started = Utc::now();
        store.push(job("j-1", "show run", started));

        let finished = started + ChronoDuration::milliseconds(1500);
        assert!(store.update("j-1", |j| {
            j.status = JobStatus::Completed;
            j.finished_at = Some(finished);
            j.output = "hostname R1".to_string();
            j.execution_time = (finished - started).num_milliseconds() as f64 / 1000.0;
        }));

        let j = store.get("j-1").expect("job");
        assert_eq!(j.status, JobStatus::Completed);
        assert!((j.execution_time - 1.5).abs() < f64::EPSILON);
        assert!(!store.update("j-missing", |_| {}));
    }

    #[test]
    fn test_history_search_and_since() {
        let mut store = JobStore::new(10);
        let t0 = Utc::now();
        let t1 = t0 + ChronoDuration::seconds(10);
        store.push(job("j-1", "show ip route", t0));
        store.push(job("j-2", "show version", t0));
        store.push(job("j-3", "show ip interface", t1));

        let routed = store.history(None, Some("ip"), None);
        assert_eq!(routed.len(), 2);

        let recent = store.history(None, None, Some(t1));
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, "j-3");

        let limited = store.history(Some(1), Some("ip"), None);
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, "j-3");
    }

    #[test]
    fn test_running_count() {
        let mut store = JobStore::new(10);
        store.push(job("j-1", "a", Utc::now()));
        store.push(job("j-2", "b", Utc::now()));
        store.update("j-1", |j| j.status = JobStatus::Failed);
        assert_eq!(store.running_count(), 1);
    }
}
