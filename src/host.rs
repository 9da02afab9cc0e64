//! Per-host scheduling state: job queues, the robots.txt gate, and failure
//! backoff. The registry is guarded by one mutex in the engine; none of the
//! methods here block or perform I/O.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use robotstxt::DefaultMatcher;
use url::Url;

use crate::job::Job;
use crate::url_utils;

/// Canonical unit of network scheduling: one (scheme, host, port).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostKey {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl HostKey {
    pub fn new(scheme: &str, host: &str, port: u16) -> Self {
        Self {
            scheme: scheme.to_string(),
            host: host.to_lowercase(),
            port,
        }
    }

    pub fn from_url(url: &Url) -> Option<Self> {
        Some(Self::new(
            url.scheme(),
            url.host_str()?,
            url_utils::effective_port(url),
        ))
    }
}

impl std::fmt::Display for HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Robots policy for one host: the raw robots.txt body (matched through
/// `robotstxt`) plus the sitemap URLs it declared.
#[derive(Debug, Clone, Default)]
pub struct RobotsPolicy {
    pub body: String,
    pub sitemaps: Vec<String>,
}

impl RobotsPolicy {
    pub fn allows(&self, user_agent: &str, url: &str) -> bool {
        let mut matcher = DefaultMatcher::default();
        matcher.one_agent_allowed_by_robots(&self.body, user_agent, url)
    }
}

/// The robots.txt gate for a host. While the robots job is pending or in
/// flight, no other job of that host may be dispatched.
#[derive(Debug, Default)]
enum RobotsGate {
    /// Robots enforcement off for this host (or not recursive).
    #[default]
    Unneeded,
    /// Synthetic /robots.txt job waiting for a worker.
    Pending(Box<Job>),
    /// A worker is fetching/processing robots.txt.
    InFlight,
    /// robots.txt processed (policy may be absent on 404 etc.).
    Done,
}

const MAX_BACKOFF_STEPS: u32 = 10;

#[derive(Debug, Default)]
pub struct Host {
    queue: VecDeque<Job>,
    robots_gate: RobotsGate,
    pub robots: Option<RobotsPolicy>,
    failures: u32,
    next_eligible: Option<Instant>,
    final_failed: bool,
}

/// Result of asking a host (or the registry) for work.
#[derive(Debug)]
pub enum NextJob {
    Job(Box<Job>),
    /// Backoff in effect; nothing dispatchable before this long.
    Wait(Duration),
    None,
}

impl Host {
    fn take_job(&mut self, now: Instant) -> NextJob {
        if self.final_failed {
            return NextJob::None;
        }

        if let Some(t) = self.next_eligible {
            if t > now {
                return NextJob::Wait(t - now);
            }
        }

        // The robots job precedes everything else on this host.
        match std::mem::take(&mut self.robots_gate) {
            RobotsGate::Pending(job) => {
                self.robots_gate = RobotsGate::InFlight;
                return NextJob::Job(job);
            }
            gate @ RobotsGate::InFlight => {
                self.robots_gate = gate;
                return NextJob::None;
            }
            gate => self.robots_gate = gate,
        }

        for i in 0..self.queue.len() {
            if let Some(parts) = &self.queue[i].parts {
                if let Some(part) = parts.claim() {
                    let mut assignment = self.queue[i].clone();
                    assignment.part_id = Some(part.id);
                    return NextJob::Job(Box::new(assignment));
                }
                // All parts claimed or done; leave the job for its workers.
            } else {
                let job = self.queue.remove(i).expect("index in bounds");
                return NextJob::Job(Box::new(job));
            }
        }

        NextJob::None
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
            && matches!(self.robots_gate, RobotsGate::Unneeded | RobotsGate::Done)
    }

    pub fn final_failed(&self) -> bool {
        self.final_failed
    }
}

/// All hosts, keyed by (scheme, host, port). Owned by the engine behind its
/// scheduling mutex.
#[derive(Debug, Default)]
pub struct HostRegistry {
    hosts: HashMap<HostKey, Host>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the host entry was newly created.
    pub fn get_or_create(&mut self, key: &HostKey) -> bool {
        if self.hosts.contains_key(key) {
            false
        } else {
            self.hosts.insert(key.clone(), Host::default());
            true
        }
    }

    pub fn get(&self, key: &HostKey) -> Option<&Host> {
        self.hosts.get(key)
    }

    /// Install the synthetic robots job, gating every other job of the host.
    pub fn set_robots_job(&mut self, key: &HostKey, job: Job) {
        if let Some(host) = self.hosts.get_mut(key) {
            host.robots_gate = RobotsGate::Pending(Box::new(job));
        }
    }

    /// Record the processed robots response and open the gate.
    pub fn robots_done(&mut self, key: &HostKey, policy: Option<RobotsPolicy>) {
        if let Some(host) = self.hosts.get_mut(key) {
            host.robots_gate = RobotsGate::Done;
            host.robots = policy;
        }
    }

    pub fn robots_policy(&self, key: &HostKey) -> Option<&RobotsPolicy> {
        self.hosts.get(key).and_then(|h| h.robots.as_ref())
    }

    /// Append a job to its host queue (FIFO).
    pub fn add_job(&mut self, job: Job) {
        if let Some(host) = self.hosts.get_mut(&job.host) {
            if !host.final_failed {
                host.queue.push_back(job);
            }
        }
    }

    /// Return jobs to the head of their host queue after a connection-level
    /// abort. Robots jobs re-arm the gate; part assignments release their
    /// part claim.
    pub fn release_jobs(&mut self, key: &HostKey, jobs: Vec<Job>) {
        let Some(host) = self.hosts.get_mut(key) else {
            return;
        };
        for mut job in jobs {
            if job.is_robots {
                host.robots_gate = RobotsGate::Pending(Box::new(job));
            } else if let (Some(parts), Some(part_id)) = (&job.parts, job.part_id) {
                parts.release(part_id);
                // The owning multi job is still queued; drop the assignment.
            } else {
                job.part_id = None;
                host.queue.push_front(job);
            }
        }
    }

    /// Remove a finished multi-part job from its host queue.
    pub fn remove_job(&mut self, key: &HostKey, job_id: usize) -> Option<Job> {
        let host = self.hosts.get_mut(key)?;
        let pos = host.queue.iter().position(|j| j.id == job_id)?;
        host.queue.remove(pos)
    }

    /// Select the next job. With a bound host only that host is consulted;
    /// otherwise all hosts are scanned and the shortest backoff wait is
    /// reported when nothing is ready.
    pub fn next_job(&mut self, bound: Option<&HostKey>, now: Instant) -> NextJob {
        if let Some(key) = bound {
            return match self.hosts.get_mut(key) {
                Some(host) => host.take_job(now),
                None => NextJob::None,
            };
        }

        let mut min_wait: Option<Duration> = None;
        for host in self.hosts.values_mut() {
            match host.take_job(now) {
                NextJob::Job(job) => return NextJob::Job(job),
                NextJob::Wait(d) => {
                    min_wait = Some(match min_wait {
                        Some(cur) => cur.min(d),
                        None => d,
                    });
                }
                NextJob::None => {}
            }
        }

        match min_wait {
            Some(d) => NextJob::Wait(d),
            None => NextJob::None,
        }
    }

    /// Count a host failure and start backoff. After `tries` consecutive
    /// failures the host is marked final-failed and its remaining jobs are
    /// returned to the caller (dropped from scheduling).
    pub fn increase_failure(
        &mut self,
        key: &HostKey,
        waitretry: Duration,
        tries: u32,
        now: Instant,
    ) -> Vec<Job> {
        let Some(host) = self.hosts.get_mut(key) else {
            return Vec::new();
        };

        host.failures += 1;
        host.next_eligible = Some(now + waitretry * host.failures.min(MAX_BACKOFF_STEPS));

        if tries > 0 && host.failures >= tries {
            self.final_failure(key)
        } else {
            Vec::new()
        }
    }

    /// Immediately mark a host dead (e.g. TLS failure) and drain its queue.
    pub fn final_failure(&mut self, key: &HostKey) -> Vec<Job> {
        let Some(host) = self.hosts.get_mut(key) else {
            return Vec::new();
        };
        host.final_failed = true;
        let mut dropped: Vec<Job> = host.queue.drain(..).collect();
        if let RobotsGate::Pending(job) = std::mem::replace(&mut host.robots_gate, RobotsGate::Done)
        {
            dropped.push(*job);
        }
        dropped
    }

    pub fn reset_failure(&mut self, key: &HostKey) {
        if let Some(host) = self.hosts.get_mut(key) {
            host.failures = 0;
            host.next_eligible = None;
        }
    }

    /// True when every host queue is empty and no robots gate is armed.
    pub fn all_idle(&self) -> bool {
        self.hosts.values().all(Host::is_idle)
    }

    pub fn queued_jobs(&self) -> usize {
        self.hosts.values().map(|h| h.queue.len()).sum()
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> HostKey {
        HostKey::new("http", "test.local", 80)
    }

    fn job(path: &str) -> Job {
        let url = Url::parse(&format!("http://test.local{}", path)).unwrap();
        Job::new(url, key())
    }

    #[test]
    fn test_fifo_order() {
        let mut registry = HostRegistry::new();
        registry.get_or_create(&key());
        registry.add_job(job("/a"));
        registry.add_job(job("/b"));

        let now = Instant::now();
        let NextJob::Job(first) = registry.next_job(None, now) else {
            panic!("expected a job");
        };
        assert_eq!(first.url.path(), "/a");
        let NextJob::Job(second) = registry.next_job(None, now) else {
            panic!("expected a job");
        };
        assert_eq!(second.url.path(), "/b");
        assert!(matches!(registry.next_job(None, now), NextJob::None));
    }

    #[test]
    fn test_robots_job_precedes_queue() {
        let mut registry = HostRegistry::new();
        registry.get_or_create(&key());
        registry.add_job(job("/page"));

        let mut robots = job("/robots.txt");
        robots.is_robots = true;
        registry.set_robots_job(&key(), robots);

        let now = Instant::now();
        let NextJob::Job(first) = registry.next_job(None, now) else {
            panic!("expected robots job");
        };
        assert!(first.is_robots);

        // Gate blocks the host until the robots response is processed.
        assert!(matches!(registry.next_job(None, now), NextJob::None));

        registry.robots_done(&key(), Some(RobotsPolicy::default()));
        let NextJob::Job(second) = registry.next_job(None, now) else {
            panic!("expected queued job");
        };
        assert_eq!(second.url.path(), "/page");
    }

    #[test]
    fn test_backoff_then_final_failure() {
        let mut registry = HostRegistry::new();
        registry.get_or_create(&key());
        registry.add_job(job("/x"));
        registry.add_job(job("/y"));

        let now = Instant::now();
        let waitretry = Duration::from_millis(100);

        let dropped = registry.increase_failure(&key(), waitretry, 3, now);
        assert!(dropped.is_empty());
        assert!(matches!(registry.next_job(None, now), NextJob::Wait(_)));

        // Eligible again after the backoff interval.
        let later = now + Duration::from_millis(150);
        assert!(matches!(registry.next_job(None, later), NextJob::Job(_)));

        registry.increase_failure(&key(), waitretry, 3, now);
        let dropped = registry.increase_failure(&key(), waitretry, 3, now);
        assert_eq!(dropped.len(), 1); // the remaining queued job
        assert!(registry.get(&key()).unwrap().final_failed());

        // Jobs added after final failure are discarded.
        registry.add_job(job("/z"));
        assert_eq!(registry.queued_jobs(), 0);
    }

    #[test]
    fn test_release_jobs_to_queue_head() {
        let mut registry = HostRegistry::new();
        registry.get_or_create(&key());
        registry.add_job(job("/1"));

        let now = Instant::now();
        let NextJob::Job(inflight) = registry.next_job(None, now) else {
            panic!("expected a job");
        };
        registry.add_job(job("/2"));

        registry.release_jobs(&key(), vec![*inflight]);
        let NextJob::Job(next) = registry.next_job(None, now) else {
            panic!("expected a job");
        };
        assert_eq!(next.url.path(), "/1");
    }

    #[test]
    fn test_reset_failure_clears_backoff() {
        let mut registry = HostRegistry::new();
        registry.get_or_create(&key());
        registry.add_job(job("/a"));

        let now = Instant::now();
        registry.increase_failure(&key(), Duration::from_secs(60), 0, now);
        assert!(matches!(registry.next_job(None, now), NextJob::Wait(_)));

        registry.reset_failure(&key());
        assert!(matches!(registry.next_job(None, now), NextJob::Job(_)));
    }

    #[test]
    fn test_bound_host_scanning() {
        let mut registry = HostRegistry::new();
        let other = HostKey::new("http", "other.local", 80);
        registry.get_or_create(&key());
        registry.get_or_create(&other);

        let mut j = Job::new(Url::parse("http://other.local/o").unwrap(), other.clone());
        j.level = 1;
        registry.add_job(j);

        let now = Instant::now();
        // Bound to an empty host: nothing, even though other host has work.
        assert!(matches!(registry.next_job(Some(&key()), now), NextJob::None));
        assert!(matches!(registry.next_job(Some(&other), now), NextJob::Job(_)));
    }

    #[test]
    fn test_robots_policy_matching() {
        let policy = RobotsPolicy {
            body: "User-agent: *\nDisallow: /private/\n".to_string(),
            sitemaps: Vec::new(),
        };
        assert!(policy.allows("webgrab", "http://test.local/public/x"));
        assert!(!policy.allows("webgrab", "http://test.local/private/x"));
    }
}
