//! Per-node execution leases
//!
//! A lease is the exclusive right to operate one node. Acquisition fails
//! fast with `NodeBusy` instead of queueing; workers renew their lease by
//! heartbeat while work runs. A lease whose heartbeat stopped is stale and
//! may be taken over by another holder, which is how a crashed conductor's
//! nodes are recovered.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use ferrite_common::{Error, Result};

#[derive(Debug, Clone)]
struct Lease {
    holder: String,
    expires_at: DateTime<Utc>,
}

/// How an acquisition succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquired {
    Fresh,
    /// The previous holder's heartbeat had stopped; the caller now owns a
    /// node that may have work in flight.
    TakenOver { previous: String },
}

pub struct LeaseTable {
    ttl: ChronoDuration,
    inner: Mutex<HashMap<Uuid, Lease>>,
}

impl LeaseTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::seconds(60)),
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Take the exclusive lease on a node, failing fast if it is live.
    pub fn acquire(&self, node: Uuid, holder: &str) -> Result<Acquired> {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();
        let outcome = match inner.get(&node) {
            Some(lease) if lease.expires_at > now => {
                return Err(Error::NodeBusy {
                    node,
                    holder: lease.holder.clone(),
                })
            }
            Some(stale) => Acquired::TakenOver {
                previous: stale.holder.clone(),
            },
            None => Acquired::Fresh,
        };
        inner.insert(
            node,
            Lease {
                holder: holder.to_string(),
                expires_at: now + self.ttl,
            },
        );
        Ok(outcome)
    }

    /// Renew the lease. Fails if the caller no longer holds it, which a
    /// worker must treat as having lost the node.
    pub fn heartbeat(&self, node: Uuid, holder: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.get_mut(&node) {
            Some(lease) if lease.holder == holder => {
                lease.expires_at = Utc::now() + self.ttl;
                Ok(())
            }
            Some(lease) => Err(Error::NodeBusy {
                node,
                holder: lease.holder.clone(),
            }),
            None => Err(Error::Internal(format!("no lease held for node {node}"))),
        }
    }

    /// Drop the lease. A release by a non-holder is ignored so a worker
    /// that lost its lease to takeover cannot free the new holder's.
    pub fn release(&self, node: Uuid, holder: &str) {
        let mut inner = self.inner.lock().unwrap();
        if inner.get(&node).is_some_and(|l| l.holder == holder) {
            inner.remove(&node);
        }
    }

    /// The current live holder, if any.
    pub fn holder(&self, node: Uuid) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .get(&node)
            .filter(|l| l.expires_at > Utc::now())
            .map(|l| l.holder.clone())
    }

    pub fn is_locked(&self, node: Uuid) -> bool {
        self.holder(node).is_some()
    }

    /// Nodes whose holder stopped heartbeating, with the dead holder's
    /// identity.
    pub fn stale(&self) -> Vec<(Uuid, String)> {
        let now = Utc::now();
        let inner = self.inner.lock().unwrap();
        inner
            .iter()
            .filter(|(_, l)| l.expires_at <= now)
            .map(|(id, l)| (*id, l.holder.clone()))
            .collect()
    }
}
