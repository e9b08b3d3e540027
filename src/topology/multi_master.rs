//! Multi-master cluster (Galera)
//!
//! Every reachable node accepts writes. The only policy left is the order in
//! which equally valid nodes are tried.

use async_trait::async_trait;
use rand::seq::SliceRandom;

use super::{Role, RoleClassifier};
use crate::config::LoadBalancePolicy;
use crate::error::Result;
use crate::host::{HostAddress, Topology};
use crate::protocol::HostConnection;

#[derive(Debug)]
pub struct MultiMasterClassifier {
    policy: LoadBalancePolicy,
}

impl MultiMasterClassifier {
    pub fn new(policy: LoadBalancePolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl RoleClassifier for MultiMasterClassifier {
    fn topology(&self) -> Topology {
        Topology::MultiMaster
    }

    async fn classify(&self, _conn: &mut dyn HostConnection) -> Result<Role> {
        Ok(Role::Master)
    }

    fn order(&self, mut hosts: Vec<HostAddress>) -> Vec<HostAddress> {
        if self.policy == LoadBalancePolicy::Random {
            hosts.shuffle(&mut rand::thread_rng());
        }
        hosts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn hosts() -> Vec<HostAddress> {
        (1..=5).map(|i| HostAddress::new(format!("galera{}", i), 3306)).collect()
    }

    #[test]
    fn test_sequential_keeps_order() {
        let classifier = MultiMasterClassifier::new(LoadBalancePolicy::Sequential);
        assert_eq!(classifier.order(hosts()), hosts());
    }

    #[test]
    fn test_random_spreads_first_choice() {
        let classifier = MultiMasterClassifier::new(LoadBalancePolicy::Random);
        let mut first_choices = HashSet::new();
        for _ in 0..200 {
            let ordered = classifier.order(hosts());
            assert_eq!(ordered.len(), 5);
            first_choices.insert(ordered[0].clone());
        }
        assert!(first_choices.len() >= 2);
    }
}
