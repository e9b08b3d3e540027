//! Election goal

use std::fmt;

/// What one election is looking for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchFilter {
    pub search_for_master: bool,
    pub search_for_replica: bool,
    /// Stop as soon as a master is found, even if a replica is still wanted
    pub fine_if_found_only_master: bool,
    /// Stop as soon as a replica is found, even if a master is still wanted
    pub fine_if_found_only_replica: bool,
    /// One pass over the candidates, no retries
    pub unique_loop: bool,
}

impl SearchFilter {
    pub fn new(search_for_master: bool, search_for_replica: bool) -> Self {
        Self {
            search_for_master,
            search_for_replica,
            fine_if_found_only_master: false,
            fine_if_found_only_replica: false,
            unique_loop: false,
        }
    }

    pub fn master_only() -> Self {
        Self::new(true, false)
    }

    pub fn replica_only() -> Self {
        Self::new(false, true)
    }

    pub fn both() -> Self {
        Self::new(true, true)
    }

    pub fn accept_only_replica(mut self) -> Self {
        self.fine_if_found_only_replica = true;
        self
    }

    pub fn with_unique_loop(mut self) -> Self {
        self.unique_loop = true;
        self
    }

    /// Nothing left to look for
    pub fn is_satisfied(&self) -> bool {
        !self.search_for_master && !self.search_for_replica
    }

    /// A partial result the election may stop on
    pub fn is_good_enough(&self) -> bool {
        self.is_satisfied()
            || (self.fine_if_found_only_master && !self.search_for_master)
            || (self.fine_if_found_only_replica && !self.search_for_replica)
    }
}

impl fmt::Display for SearchFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SearchFilter{{master={}, replica={}",
            self.search_for_master, self.search_for_replica
        )?;
        if self.fine_if_found_only_master {
            write!(f, ", fine_if_only_master")?;
        }
        if self.fine_if_found_only_replica {
            write!(f, ", fine_if_only_replica")?;
        }
        if self.unique_loop {
            write!(f, ", unique_loop")?;
        }
        write!(f, "}}")
    }
}
