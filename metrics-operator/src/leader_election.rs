//! Lease based leader election, so that only one operator replica measures.
use std::time::Duration;

use k8s_openapi::{
    api::coordination::v1::{Lease, LeaseSpec},
    apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta},
    chrono::{self, DateTime, Utc},
};
use kube::{Api, Client, ResourceExt, api::PostParams};

use crate::errors::ExtKubeApiError;

pub(crate) const LEASE_NAME: &str = "metrics-operator-leader";

const LEASE_DURATION: Duration = Duration::from_secs(15);

const RENEW_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Create,
    /// We hold the lease.
    Renew,
    /// The lease is free or expired.
    TakeOver,
    /// Somebody else holds the lease.
    Wait,
}

fn decide(lease: Option<&Lease>, identity: &str, now: DateTime<Utc>) -> Decision {
    let Some(lease) = lease else {
        return Decision::Create;
    };
    let spec = lease.spec.clone().unwrap_or_default();
    match spec.holder_identity.as_deref() {
        Some(holder) if holder == identity => Decision::Renew,
        None | Some("") => Decision::TakeOver,
        Some(_) => {
            let duration = spec
                .lease_duration_seconds
                .map_or(LEASE_DURATION.as_secs() as i64, i64::from);
            match spec.renew_time.or(spec.acquire_time) {
                Some(MicroTime(renewed)) if renewed + chrono::Duration::seconds(duration) > now => {
                    Decision::Wait
                }
                _ => Decision::TakeOver,
            }
        }
    }
}

/// Participates in the election of the Lease [`LEASE_NAME`].
pub(crate) struct LeaderElector {
    api: Api<Lease>,
    identity: String,
}

impl LeaderElector {
    pub(crate) fn new(client: Client, namespace: &str, identity: String) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            identity,
        }
    }

    fn spec(&self, previous: Option<&LeaseSpec>, now: DateTime<Utc>) -> LeaseSpec {
        let previous = previous.cloned().unwrap_or_default();
        let transitions = previous.lease_transitions.unwrap_or_default();
        let (acquire_time, lease_transitions) =
            if previous.holder_identity.as_deref() == Some(self.identity.as_str()) {
                (previous.acquire_time, transitions)
            } else {
                (Some(MicroTime(now)), transitions + 1)
            };
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
            acquire_time,
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(lease_transitions),
            ..Default::default()
        }
    }

    /// Try to acquire or renew the lease once. Returns whether it is held.
    async fn try_acquire(&self) -> Result<bool, kube::Error> {
        let current = self.api.get_opt(LEASE_NAME).await?;
        let now = Utc::now();
        let result = match (decide(current.as_ref(), &self.identity, now), current) {
            (Decision::Wait, _) => return Ok(false),
            (Decision::Create, _) | (_, None) => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(LEASE_NAME.to_string()),
                        ..Default::default()
                    },
                    spec: Some(self.spec(None, now)),
                };
                self.api.create(&PostParams::default(), &lease).await
            }
            (_, Some(mut lease)) => {
                lease.spec = Some(self.spec(lease.spec.as_ref(), now));
                // The resourceVersion guards against concurrent take-overs.
                self.api
                    .replace(LEASE_NAME, &PostParams::default(), &lease)
                    .await
            }
        };
        match result {
            Ok(_) => Ok(true),
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Block until this replica leads.
    pub(crate) async fn acquire(&self) {
        info!("waiting for leadership of lease {} as {}", LEASE_NAME, self.identity);
        loop {
            match self.try_acquire().await {
                Ok(true) => {
                    info!("acquired lease {}", LEASE_NAME);
                    return;
                }
                Ok(false) => {}
                Err(e) => warn!("failed to acquire lease {}: {}", LEASE_NAME, e),
            }
            tokio::time::sleep(RENEW_INTERVAL).await;
        }
    }

    /// Renew the lease until it is lost. Completes when leadership is lost.
    pub(crate) async fn keep_alive(&self) {
        let mut renewed = tokio::time::Instant::now();
        loop {
            tokio::time::sleep(RENEW_INTERVAL).await;
            match self.try_acquire().await {
                Ok(true) => renewed = tokio::time::Instant::now(),
                Ok(false) => {
                    error!("lease {} was taken over", LEASE_NAME);
                    return;
                }
                Err(e) if renewed.elapsed() < LEASE_DURATION => {
                    warn!("failed to renew lease {}: {}", LEASE_NAME, e)
                }
                Err(e) => {
                    error!("failed to renew lease {} in time: {}", LEASE_NAME, e);
                    return;
                }
            }
        }
    }

    /// Give the lease up, so that another replica can take over right away.
    pub(crate) async fn release(&self) {
        let lease = match self.api.get_opt(LEASE_NAME).await {
            Ok(Some(lease)) => lease,
            Ok(None) => return,
            Err(e) => {
                warn!("failed to release lease {}: {}", LEASE_NAME, e);
                return;
            }
        };
        let mut spec = lease.spec.clone().unwrap_or_default();
        if spec.holder_identity.as_deref() != Some(self.identity.as_str()) {
            return;
        }
        spec.holder_identity = None;
        spec.renew_time = None;
        let released = Lease {
            spec: Some(spec),
            ..lease
        };
        match self
            .api
            .replace(&released.name_any(), &PostParams::default(), &released)
            .await
        {
            Ok(_) => info!("released lease {}", LEASE_NAME),
            Err(e) => warn!("failed to release lease {}: {}", LEASE_NAME, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(holder: Option<&str>, renewed_secs_ago: i64, now: DateTime<Utc>) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: holder.map(str::to_string),
                lease_duration_seconds: Some(15),
                renew_time: Some(MicroTime(now - chrono::Duration::seconds(renewed_secs_ago))),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn decisions() {
        let now = Utc::now();
        assert_eq!(Decision::Create, decide(None, "pod-a", now));
        assert_eq!(
            Decision::Renew,
            decide(Some(&lease(Some("pod-a"), 3, now)), "pod-a", now)
        );
        assert_eq!(
            Decision::Wait,
            decide(Some(&lease(Some("pod-b"), 3, now)), "pod-a", now)
        );
        assert_eq!(
            Decision::TakeOver,
            decide(Some(&lease(Some("pod-b"), 20, now)), "pod-a", now)
        );
        assert_eq!(
            Decision::TakeOver,
            decide(Some(&lease(None, 1, now)), "pod-a", now)
        );
    }

    #[tokio::test]
    async fn lease_transitions_count_new_holders() {
        let elector = LeaderElector::new(
            crate::utils::offline_client(),
            "ops",
            "pod-a".to_string(),
        );
        let now = Utc::now();
        let created = elector.spec(None, now);
        assert_eq!(Some(1), created.lease_transitions);
        assert_eq!(Some("pod-a"), created.holder_identity.as_deref());
        let renewed = elector.spec(Some(&created), now + chrono::Duration::seconds(5));
        assert_eq!(Some(1), renewed.lease_transitions);
        assert_eq!(created.acquire_time, renewed.acquire_time);
        let foreign = LeaseSpec {
            holder_identity: Some("pod-b".to_string()),
            lease_transitions: Some(4),
            ..Default::default()
        };
        assert_eq!(Some(5), elector.spec(Some(&foreign), now).lease_transitions);
    }
}
