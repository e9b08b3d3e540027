//! Host Search Loop
//!
//! Sweeps the candidate hosts in priority order, connects, asks the
//! classifier for the role and hands wanted handles to the listener state.
//! Runs with the listener state borrowed mutably, which the caller only
//! obtains through the exclusive failover lock.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;

use super::blacklist::Blacklist;
use super::filter::SearchFilter;
use super::listener::ListenerState;
use crate::error::{Error, SQLSTATE_CONNECTION_EXCEPTION};
use crate::host::HostAddress;
use crate::protocol::{Connector, Handle};
use crate::topology::{Role, RoleClassifier};

/// Everything an election needs besides the listener state
pub struct SearchContext {
    pub connector: Arc<dyn Connector>,
    pub classifier: Arc<dyn RoleClassifier>,
    pub blacklist: Arc<Blacklist>,
    /// Full passes before giving up
    pub retries_all_down: u32,
    /// Bound on the role probe and the master lookup
    pub connect_timeout: Duration,
    pub blacklist_timeout: Duration,
}

/// Terminal result of an election
#[derive(Debug)]
pub enum Outcome {
    Found,
    Exhausted(Error),
}

impl Outcome {
    pub fn is_found(&self) -> bool {
        matches!(self, Outcome::Found)
    }
}

/// Run one election over `candidates`
pub async fn search(
    ctx: &SearchContext,
    state: &mut ListenerState,
    candidates: &[HostAddress],
    filter: &mut SearchFilter,
) -> Outcome {
    let mut passes_left = if filter.unique_loop {
        1
    } else {
        ctx.retries_all_down.max(1)
    };
    let mut queue: VecDeque<HostAddress> = VecDeque::new();
    let mut last_error: Option<Error> = None;
    let mut first_pass = true;

    tracing::debug!("Starting election with {}", filter);

    loop {
        if state.explicitly_closed {
            return Outcome::Exhausted(Error::ConnectionClosed);
        }
        if !state.master_host_fail && !state.secondary_host_fail {
            return Outcome::Found;
        }

        if queue.is_empty() {
            if passes_left == 0 {
                break;
            }
            passes_left -= 1;
            if !first_pass {
                state.check_if_type_changed(ctx, filter).await;
                if filter.is_good_enough() {
                    return Outcome::Found;
                }
            }
            first_pass = false;
            queue = working_copy(ctx, state, candidates).await;
            if queue.is_empty() {
                break;
            }
        }

        let Some(host) = queue.pop_front() else {
            break;
        };

        if let Err(e) = attempt(ctx, state, &host, candidates, filter, &mut queue).await {
            last_error = Some(e);
        }

        if filter.is_good_enough() {
            tracing::debug!("Election satisfied after {}", host);
            return Outcome::Found;
        }
    }

    let role = if filter.search_for_master {
        Role::Master
    } else {
        Role::Replica
    };
    tracing::warn!("No active connection found for {}", role);
    Outcome::Exhausted(exhausted_error(role, last_error))
}

/// Connect to one host and route it by role. Returns the connect or probe
/// error when the host could not be used.
async fn attempt(
    ctx: &SearchContext,
    state: &mut ListenerState,
    host: &HostAddress,
    candidates: &[HostAddress],
    filter: &mut SearchFilter,
    queue: &mut VecDeque<HostAddress>,
) -> Result<(), Error> {
    let mut conn = match ctx.connector.connect(host).await {
        Ok(conn) => conn,
        Err(e) => {
            tracing::debug!("Could not connect to {}: {}", host, e);
            ctx.blacklist.record(host, Instant::now()).await;
            return Err(e);
        }
    };
    ctx.blacklist.clear(host).await;

    let role = match timeout(ctx.connect_timeout, ctx.classifier.classify(conn.as_mut())).await {
        Ok(Ok(role)) => role,
        Ok(Err(e)) => {
            tracing::debug!("Role probe failed on {}: {}", host, e);
            let _ = conn.close().await;
            ctx.blacklist.record(host, Instant::now()).await;
            return Err(e);
        }
        Err(_) => {
            let _ = conn.close().await;
            ctx.blacklist.record(host, Instant::now()).await;
            return Err(Error::ConnectionTimeout(host.to_string()));
        }
    };
    tracing::debug!("{} classified as {}", host, role);

    if role == Role::Replica && filter.search_for_master {
        let lookup = ctx.classifier.probable_master(conn.as_mut(), candidates);
        let master = timeout(ctx.connect_timeout, lookup)
            .await
            .unwrap_or_else(|_| Err(Error::ConnectionTimeout(host.to_string())));
        match master {
            Ok(Some(master)) => {
                if let Some(pos) = queue.iter().position(|h| *h == master) {
                    if let Some(master) = queue.remove(pos) {
                        tracing::debug!("{} reports {} as master, trying it next", host, master);
                        queue.push_front(master);
                    }
                }
            }
            Ok(None) => {}
            Err(e) => tracing::debug!("Master lookup on {} failed: {}", host, e),
        }
    }

    if filter.search_for_master && role == Role::Master {
        filter.search_for_master = false;
        state.found_active_master(Handle::new(conn, role)).await;
    } else if filter.search_for_replica && role == Role::Replica {
        filter.search_for_replica = false;
        state.found_active_secondary(Handle::new(conn, role)).await;
    } else {
        tracing::debug!("{} is a {}, not wanted by this election", host, role);
        let _ = conn.close().await;
    }
    Ok(())
}

/// Candidates for one pass: usable hosts in classifier order, then
/// blacklisted hosts as a last resort. Hosts already bound to a live
/// handle are left out.
async fn working_copy(
    ctx: &SearchContext,
    state: &ListenerState,
    candidates: &[HostAddress],
) -> VecDeque<HostAddress> {
    let bound = state.live_hosts();
    let now = Instant::now();
    let mut fresh = Vec::with_capacity(candidates.len());
    let mut excluded = Vec::new();

    for host in candidates.iter().filter(|h| !bound.contains(h)) {
        if ctx.blacklist.is_excluded(host, now, ctx.blacklist_timeout).await {
            excluded.push(host.clone());
        } else {
            fresh.push(host.clone());
        }
    }

    let mut queue: VecDeque<_> = ctx.classifier.order(fresh).into();
    queue.extend(excluded);
    queue
}

fn exhausted_error(role: Role, last_error: Option<Error>) -> Error {
    let (code, sql_state) = match &last_error {
        Some(e) if e.is_connection_exception() => (e.code(), e.sql_state().to_string()),
        Some(e) => (e.code(), SQLSTATE_CONNECTION_EXCEPTION.to_string()),
        None => (0, SQLSTATE_CONNECTION_EXCEPTION.to_string()),
    };
    Error::NoActiveConnection {
        role,
        code,
        sql_state,
        source: last_error.map(Box::new),
    }
}
