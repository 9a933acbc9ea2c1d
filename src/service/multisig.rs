//! Multi-Signature Registration Proposals
//!
//! ```text
//!            approve (threshold)           execute
//! Pending ─────────────────────► Approved ─────────► Executed
//!    │
//!    ├── reject ──► Rejected
//!    └── past expires_at ──► Expired
//! ```
//!
//! Every transition is a compare-and-set on the proposal revision; a
//! concurrent writer forces a reload and the transition is re-evaluated.
//!
//! Once any signer is registered, only active registered signers may vote.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::proof::commitment::CommitmentPackage;
use crate::store::models::default_proposal_ttl;
use crate::store::{
    Approval, DocumentStore, Proposal, ProposalStatus, Rejection, Signer, StoreError,
};

use super::events::{EventBus, ServerEvent};

/// Reloads attempted after a concurrent modification.
const MAX_CAS_RETRIES: usize = 8;

/// Multisig errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MultisigError {
    /// Bad arguments.
    #[error("{0}")]
    Validation(String),
    /// Unknown proposal.
    #[error("proposal {0} not found")]
    NotFound(String),
    /// Proposal passed its expiry.
    #[error("proposal {0} has expired")]
    Expired(String),
    /// Vote on a proposal that is no longer collecting votes.
    #[error("proposal {id} is {status:?}, not pending")]
    NotPending {
        /// Proposal id.
        id: String,
        /// Current status.
        status: ProposalStatus,
    },
    /// Execution of a proposal below threshold.
    #[error("proposal {id} is {status:?}, not approved")]
    NotApproved {
        /// Proposal id.
        id: String,
        /// Current status.
        status: ProposalStatus,
    },
    /// Second vote by the same signer.
    #[error("{voter} already voted on proposal {id}")]
    AlreadyVoted {
        /// Proposal id.
        id: String,
        /// Voter.
        voter: String,
    },
    /// The device already has an open proposal.
    #[error("device {0} already has an active proposal")]
    ActiveProposal(String),
    /// Address is already in the signer registry.
    #[error("signer {0} already authorized")]
    SignerExists(String),
    /// Voter is not an active registered signer.
    #[error("{0} is not an authorized signer")]
    UnauthorizedSigner(String),
    /// Persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Parameters of a new proposal.
#[derive(Clone, Debug)]
pub struct NewProposal {
    /// Device to register.
    pub device_id: String,
    /// Device name.
    pub device_name: String,
    /// Device category.
    pub device_type: String,
    /// Device public key hash.
    pub public_key_hash: String,
    /// Proof package backing the registration.
    pub package: CommitmentPackage,
    /// Proposer identity.
    pub proposer: String,
    /// Approvals needed.
    pub required_approvals: u32,
}

/// Outcome of a transition closure.
enum Step {
    Write,
    Unchanged,
}

/// Proposal state machine over a [`DocumentStore`].
pub struct MultisigManager {
    store: Arc<dyn DocumentStore>,
    events: EventBus,
    ttl: Duration,
}

impl MultisigManager {
    /// Create a manager with the default seven day expiry.
    pub fn new(store: Arc<dyn DocumentStore>, events: EventBus) -> Self {
        Self { store, events, ttl: default_proposal_ttl() }
    }

    /// Override the proposal lifetime.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Open a proposal for a device registration.
    #[instrument(skip(self, request), fields(device_id = %request.device_id))]
    pub async fn create(&self, request: NewProposal) -> Result<Proposal, MultisigError> {
        if request.device_id.is_empty() {
            return Err(MultisigError::Validation("device id is required".into()));
        }
        if request.required_approvals == 0 {
            return Err(MultisigError::Validation("at least one approval is required".into()));
        }

        let blocking = self.store.list_proposals().await?.into_iter().any(|p| {
            p.device_id == request.device_id
                && !matches!(p.status, ProposalStatus::Rejected | ProposalStatus::Expired)
        });
        if blocking {
            return Err(MultisigError::ActiveProposal(request.device_id));
        }

        let now = Utc::now();
        let proposal = Proposal {
            proposal_id: Uuid::new_v4().to_string(),
            device_id: request.device_id,
            device_name: request.device_name,
            device_type: request.device_type,
            public_key_hash: request.public_key_hash,
            package: request.package,
            proposer: request.proposer,
            required_approvals: request.required_approvals,
            approvals: Vec::new(),
            rejections: Vec::new(),
            status: ProposalStatus::Pending,
            created_at: now,
            expires_at: now + self.ttl,
            executed_at: None,
            execution_tx: None,
            revision: 0,
        };
        self.store.insert_proposal(proposal.clone()).await?;

        info!(proposal_id = %proposal.proposal_id, required = proposal.required_approvals, "proposal created");
        self.announce(&proposal);
        Ok(proposal)
    }

    /// Register an authorized signer.
    #[instrument(skip(self))]
    pub async fn add_signer(&self, address: &str, name: &str) -> Result<Signer, MultisigError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(MultisigError::Validation("signer address is required".into()));
        }
        if name.trim().is_empty() {
            return Err(MultisigError::Validation("signer name is required".into()));
        }

        let signer = Signer {
            address: address.to_string(),
            name: name.trim().to_string(),
            added_at: Utc::now(),
            is_active: true,
        };
        match self.store.insert_signer(signer.clone()).await {
            Ok(()) => {}
            Err(StoreError::Conflict { .. }) => {
                return Err(MultisigError::SignerExists(signer.address))
            }
            Err(e) => return Err(e.into()),
        }
        info!(address = %signer.address, "signer added");
        Ok(signer)
    }

    /// Registered signers in insertion order.
    pub async fn list_signers(&self) -> Result<Vec<Signer>, MultisigError> {
        Ok(self.store.list_signers().await?)
    }

    /// An empty registry admits every voter.
    async fn check_signer(&self, voter: &str) -> Result<(), MultisigError> {
        let signers = self.store.list_signers().await?;
        if signers.is_empty() || signers.iter().any(|s| s.is_active && s.address == voter) {
            return Ok(());
        }
        warn!(voter, "vote from unregistered signer");
        Err(MultisigError::UnauthorizedSigner(voter.to_string()))
    }

    /// Add an approval; reaching the threshold approves the proposal.
    #[instrument(skip(self, signature))]
    pub async fn approve(
        &self,
        proposal_id: &str,
        approver: &str,
        signature: &str,
    ) -> Result<Proposal, MultisigError> {
        self.check_signer(approver).await?;
        self.vote(proposal_id, |p, now| {
            if p.has_voted(approver) {
                return Err(MultisigError::AlreadyVoted {
                    id: p.proposal_id.clone(),
                    voter: approver.to_string(),
                });
            }
            p.approvals.push(Approval {
                approver: approver.to_string(),
                signature: signature.to_string(),
                approved_at: now,
            });
            if p.approvals.len() >= p.required_approvals as usize {
                p.status = ProposalStatus::Approved;
            }
            Ok(())
        })
        .await
    }

    /// Reject a pending proposal.
    #[instrument(skip(self))]
    pub async fn reject(
        &self,
        proposal_id: &str,
        rejector: &str,
        reason: &str,
    ) -> Result<Proposal, MultisigError> {
        self.check_signer(rejector).await?;
        self.vote(proposal_id, |p, now| {
            if p.has_voted(rejector) {
                return Err(MultisigError::AlreadyVoted {
                    id: p.proposal_id.clone(),
                    voter: rejector.to_string(),
                });
            }
            p.rejections.push(Rejection {
                rejector: rejector.to_string(),
                reason: reason.to_string(),
                rejected_at: now,
            });
            p.status = ProposalStatus::Rejected;
            Ok(())
        })
        .await
    }

    /// Mark an approved proposal executed.
    #[instrument(skip(self))]
    pub async fn execute(
        &self,
        proposal_id: &str,
        execution_tx: Option<String>,
    ) -> Result<Proposal, MultisigError> {
        self.transition(proposal_id, |p, now| {
            if p.status != ProposalStatus::Approved {
                return Err(MultisigError::NotApproved {
                    id: p.proposal_id.clone(),
                    status: p.status,
                });
            }
            p.status = ProposalStatus::Executed;
            p.executed_at = Some(now);
            p.execution_tx = execution_tx.clone();
            Ok(Step::Write)
        })
        .await
    }

    /// Look up a proposal.
    pub async fn get(&self, proposal_id: &str) -> Result<Proposal, MultisigError> {
        self.store
            .get_proposal(proposal_id)
            .await?
            .ok_or_else(|| MultisigError::NotFound(proposal_id.to_string()))
    }

    /// Proposals, optionally filtered by status.
    pub async fn list(&self, status: Option<ProposalStatus>) -> Result<Vec<Proposal>, MultisigError> {
        let mut proposals = self.store.list_proposals().await?;
        if let Some(status) = status {
            proposals.retain(|p| p.status == status);
        }
        Ok(proposals)
    }

    /// Expire every pending proposal past its deadline. Returns the count.
    pub async fn expire_stale(&self) -> Result<usize, MultisigError> {
        let now = Utc::now();
        let mut expired = 0;
        for p in self.list(Some(ProposalStatus::Pending)).await? {
            if !p.is_expired_at(now) {
                continue;
            }
            // A concurrent vote may have moved it on; skip those.
            let result = self
                .transition(&p.proposal_id, |p, now| {
                    if p.status == ProposalStatus::Pending && p.is_expired_at(now) {
                        p.status = ProposalStatus::Expired;
                        Ok(Step::Write)
                    } else {
                        Ok(Step::Unchanged)
                    }
                })
                .await?;
            if result.status == ProposalStatus::Expired {
                expired += 1;
            }
        }
        if expired > 0 {
            info!(expired, "stale proposals expired");
        }
        Ok(expired)
    }

    /// Apply a vote to a pending proposal, expiring it first if overdue.
    async fn vote<F>(&self, proposal_id: &str, mut cast: F) -> Result<Proposal, MultisigError>
    where
        F: FnMut(&mut Proposal, DateTime<Utc>) -> Result<(), MultisigError>,
    {
        let mut overdue = false;
        let proposal = self
            .transition(proposal_id, |p, now| {
                overdue = false;
                if p.status != ProposalStatus::Pending {
                    return Err(MultisigError::NotPending {
                        id: p.proposal_id.clone(),
                        status: p.status,
                    });
                }
                if p.is_expired_at(now) {
                    p.status = ProposalStatus::Expired;
                    overdue = true;
                    return Ok(Step::Write);
                }
                cast(p, now).map(|()| Step::Write)
            })
            .await?;

        if overdue {
            warn!(proposal_id, "vote on expired proposal");
            return Err(MultisigError::Expired(proposal_id.to_string()));
        }
        Ok(proposal)
    }

    /// Load, mutate and compare-and-set until the write lands.
    async fn transition<F>(&self, proposal_id: &str, mut apply: F) -> Result<Proposal, MultisigError>
    where
        F: FnMut(&mut Proposal, DateTime<Utc>) -> Result<Step, MultisigError>,
    {
        for _ in 0..MAX_CAS_RETRIES {
            let mut proposal = self.get(proposal_id).await?;
            match apply(&mut proposal, Utc::now())? {
                Step::Unchanged => return Ok(proposal),
                Step::Write => {}
            }

            match self.store.update_proposal(proposal).await {
                Ok(stored) => {
                    debug!(proposal_id, revision = stored.revision, status = ?stored.status, "proposal updated");
                    self.announce(&stored);
                    return Ok(stored);
                }
                Err(StoreError::Stale { .. }) => {
                    debug!(proposal_id, "concurrent proposal update, reloading");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(StoreError::Stale { kind: "proposal", id: proposal_id.to_string() }.into())
    }

    fn announce(&self, proposal: &Proposal) {
        self.events.publish(ServerEvent::ProposalUpdated {
            proposal_id: proposal.proposal_id.clone(),
            status: proposal.status,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn manager() -> MultisigManager {
        MultisigManager::new(Arc::new(MemoryStore::new()), EventBus::default())
    }

    fn request(device_id: &str, required: u32) -> NewProposal {
        NewProposal {
            device_id: device_id.into(),
            device_name: "Boiler sensor".into(),
            device_type: "sensor".into(),
            public_key_hash: "ab".repeat(32),
            package: CommitmentPackage::default(),
            proposer: "alice".into(),
            required_approvals: required,
        }
    }

    #[tokio::test]
    async fn test_threshold_transitions() {
        let m = manager();
        let p = m.create(request("dev-1", 2)).await.unwrap();
        assert_eq!(p.status, ProposalStatus::Pending);

        let p1 = m.approve(&p.proposal_id, "bob", "sig-b").await.unwrap();
        assert_eq!(p1.status, ProposalStatus::Pending);
        assert_eq!(p1.approvals.len(), 1);

        assert_eq!(
            m.approve(&p.proposal_id, "bob", "sig-b").await,
            Err(MultisigError::AlreadyVoted { id: p.proposal_id.clone(), voter: "bob".into() })
        );
        assert!(matches!(
            m.execute(&p.proposal_id, None).await,
            Err(MultisigError::NotApproved { status: ProposalStatus::Pending, .. })
        ));

        let p2 = m.approve(&p.proposal_id, "carol", "sig-c").await.unwrap();
        assert_eq!(p2.status, ProposalStatus::Approved);
        assert!(matches!(
            m.approve(&p.proposal_id, "dave", "sig-d").await,
            Err(MultisigError::NotPending { status: ProposalStatus::Approved, .. })
        ));

        let done = m.execute(&p.proposal_id, Some("0xabc".into())).await.unwrap();
        assert_eq!(done.status, ProposalStatus::Executed);
        assert_eq!(done.execution_tx.as_deref(), Some("0xabc"));
        assert!(done.executed_at.is_some());
    }

    #[tokio::test]
    async fn test_reject_and_recreate() {
        let m = manager();
        let p = m.create(request("dev-1", 1)).await.unwrap();
        assert_eq!(
            m.create(request("dev-1", 1)).await.unwrap_err(),
            MultisigError::ActiveProposal("dev-1".into())
        );

        let rejected = m.reject(&p.proposal_id, "bob", "unknown hardware").await.unwrap();
        assert_eq!(rejected.status, ProposalStatus::Rejected);
        assert_eq!(rejected.rejections[0].reason, "unknown hardware");
        assert!(m.approve(&p.proposal_id, "carol", "sig").await.is_err());

        // A rejected proposal no longer blocks the device
        assert!(m.create(request("dev-1", 1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_on_vote() {
        let m = manager().with_ttl(Duration::seconds(-1));
        let p = m.create(request("dev-1", 1)).await.unwrap();

        assert_eq!(
            m.approve(&p.proposal_id, "bob", "sig").await,
            Err(MultisigError::Expired(p.proposal_id.clone()))
        );
        assert_eq!(m.get(&p.proposal_id).await.unwrap().status, ProposalStatus::Expired);
        assert!(matches!(
            m.approve(&p.proposal_id, "bob", "sig").await,
            Err(MultisigError::NotPending { status: ProposalStatus::Expired, .. })
        ));
    }

    #[tokio::test]
    async fn test_expire_stale_sweep() {
        let m = manager().with_ttl(Duration::seconds(-1));
        m.create(request("dev-1", 1)).await.unwrap();
        m.create(request("dev-2", 1)).await.unwrap();

        assert_eq!(m.expire_stale().await.unwrap(), 2);
        assert_eq!(m.expire_stale().await.unwrap(), 0);
        assert_eq!(m.list(Some(ProposalStatus::Expired)).await.unwrap().len(), 2);
        assert!(m.list(Some(ProposalStatus::Pending)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_validation_and_not_found() {
        let m = manager();
        assert!(matches!(
            m.create(request("dev-1", 0)).await,
            Err(MultisigError::Validation(_))
        ));
        assert_eq!(
            m.approve("missing", "bob", "sig").await,
            Err(MultisigError::NotFound("missing".into()))
        );
    }

    #[tokio::test]
    async fn test_events_published() {
        let m = manager();
        let mut rx = m.events.subscribe();
        let p = m.create(request("dev-1", 1)).await.unwrap();
        m.approve(&p.proposal_id, "bob", "sig").await.unwrap();

        let statuses: Vec<_> = [rx.recv().await.unwrap(), rx.recv().await.unwrap()]
            .into_iter()
            .map(|e| match e {
                ServerEvent::ProposalUpdated { status, .. } => status,
                other => panic!("unexpected event {:?}", other),
            })
            .collect();
        assert_eq!(statuses, vec![ProposalStatus::Pending, ProposalStatus::Approved]);
    }

    #[tokio::test]
    async fn test_signer_registry_gates_votes() {
        let m = manager();
        let p = m.create(request("dev-1", 2)).await.unwrap();

        // Open voting until the first signer is registered
        m.approve(&p.proposal_id, "bob", "sig-b").await.unwrap();

        let carol = m.add_signer("carol", "Carol").await.unwrap();
        assert!(carol.is_active);
        assert_eq!(
            m.add_signer("carol", "Carol again").await,
            Err(MultisigError::SignerExists("carol".into()))
        );
        assert!(matches!(m.add_signer("  ", "x").await, Err(MultisigError::Validation(_))));
        assert!(matches!(m.add_signer("dave", "").await, Err(MultisigError::Validation(_))));
        assert_eq!(m.list_signers().await.unwrap(), vec![carol]);

        assert_eq!(
            m.reject(&p.proposal_id, "mallory", "no").await,
            Err(MultisigError::UnauthorizedSigner("mallory".into()))
        );
        let approved = m.approve(&p.proposal_id, "carol", "sig-c").await.unwrap();
        assert_eq!(approved.status, ProposalStatus::Approved);
    }

    #[tokio::test]
    async fn test_concurrent_approvals_all_counted() {
        let m = Arc::new(manager());
        let p = m.create(request("dev-1", 5)).await.unwrap();
        let handles: Vec<_> = (0..5)
            .map(|i| {
                let m = Arc::clone(&m);
                let id = p.proposal_id.clone();
                tokio::spawn(async move { m.approve(&id, &format!("signer-{}", i), "sig").await })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }
        let done = m.get(&p.proposal_id).await.unwrap();
        assert_eq!(done.approvals.len(), 5);
        assert_eq!(done.status, ProposalStatus::Approved);
    }
}
