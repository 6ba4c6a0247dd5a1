//! Projection records and the exchange lifecycle state machine.
//!
//! Everything in this module is pure: no I/O, no locking. The engine in
//! [`actor`](crate::actor) feeds stored records and incoming updates through
//! [`Record::reconcile`] and persists whatever it returns.

use std::fmt;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::Rejection;

/// A current-state row derived from a sequence of partial events.
///
/// The implementing type itself is the stored row. A row is created from
/// [`create`](Record::create) defaults the first time an id is seen and is
/// then overlaid by every accepted update.
///
/// # Contract
///
/// - [`reconcile`](Record::reconcile) must be deterministic and free of side
///   effects. It either returns the complete row to write or a [`Rejection`].
/// - Fields absent from an update must never revert a stored value.
/// - The row's id never changes once created.
pub trait Record:
    Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Table name (e.g. `"service"`). Used as a directory name by file-backed stores.
    const TABLE: &'static str;

    /// Partial payload accepted by this record kind.
    type Update: Send + 'static;

    /// A fresh row carrying the declared defaults.
    fn create(id: u64) -> Self;

    /// Stable entity identifier.
    fn id(&self) -> u64;

    /// Block time of the event that produced the current state.
    fn when(&self) -> u64;

    /// Block time carried by an update, if any.
    fn update_when(update: &Self::Update) -> Option<u64>;

    /// Validate `update` against the stored row (`None` if the id is new)
    /// and produce the row to write.
    ///
    /// # Errors
    ///
    /// Returns a [`Rejection`] when the update may not be applied. Nothing
    /// is written in that case.
    fn reconcile(current: Option<&Self>, id: u64, update: Self::Update) -> Result<Self, Rejection>;
}

/// Overwrite `slot` only when the incoming value is present.
fn overlay<T>(slot: &mut T, incoming: Option<T>) {
    if let Some(value) = incoming {
        *slot = value;
    }
}

/// Like [`overlay`], for optional columns.
fn overlay_opt<T>(slot: &mut Option<T>, incoming: Option<T>) {
    if incoming.is_some() {
        *slot = incoming;
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// A marketplace service listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceRecord {
    pub id: u64,
    pub when: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub active: bool,
}

/// Fields a service event may carry. Every field is optional; `null` is
/// treated the same as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePatch {
    pub when: Option<u64>,
    pub uri: Option<String>,
    pub owner: Option<String>,
    pub name: Option<String>,
    pub active: Option<bool>,
}

impl ServiceRecord {
    fn merge(&mut self, patch: ServicePatch) {
        overlay(&mut self.when, patch.when);
        overlay_opt(&mut self.uri, patch.uri);
        overlay_opt(&mut self.owner, patch.owner);
        overlay_opt(&mut self.name, patch.name);
        overlay(&mut self.active, patch.active);
    }
}

impl Record for ServiceRecord {
    const TABLE: &'static str = "service";

    type Update = ServicePatch;

    fn create(id: u64) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn when(&self) -> u64 {
        self.when
    }

    fn update_when(update: &ServicePatch) -> Option<u64> {
        update.when
    }

    fn reconcile(current: Option<&Self>, id: u64, patch: ServicePatch) -> Result<Self, Rejection> {
        let mut record = current.cloned().unwrap_or_else(|| Self::create(id));
        record.merge(patch);
        Ok(record)
    }
}

// ---------------------------------------------------------------------------
// Exchange lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle states of an exchange.
///
/// The declaration order matches the on-chain enum, so producers may send
/// either the name or the ordinal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "StateRepr")]
pub enum ExchangeState {
    #[default]
    Offered,
    Funded,
    Disputed,
    Resolved,
    Completed,
    Voided,
}

impl ExchangeState {
    const ALL: [ExchangeState; 6] = [
        Self::Offered,
        Self::Funded,
        Self::Disputed,
        Self::Resolved,
        Self::Completed,
        Self::Voided,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offered => "Offered",
            Self::Funded => "Funded",
            Self::Disputed => "Disputed",
            Self::Resolved => "Resolved",
            Self::Completed => "Completed",
            Self::Voided => "Voided",
        }
    }

    /// Look up a state by its on-chain ordinal.
    pub fn from_ordinal(ordinal: u64) -> Option<Self> {
        usize::try_from(ordinal)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }

    /// `Completed` and `Voided` accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Voided)
    }
}

impl fmt::Display for ExchangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire forms accepted for [`ExchangeState`].
#[derive(Deserialize)]
#[serde(untagged)]
enum StateRepr {
    Ordinal(u64),
    Name(String),
}

impl TryFrom<StateRepr> for ExchangeState {
    type Error = String;

    fn try_from(repr: StateRepr) -> Result<Self, Self::Error> {
        match repr {
            StateRepr::Ordinal(n) => {
                Self::from_ordinal(n).ok_or_else(|| format!("unknown exchange state ordinal {n}"))
            }
            StateRepr::Name(name) => Self::ALL
                .into_iter()
                .find(|s| s.as_str() == name)
                .ok_or_else(|| format!("unknown exchange state `{name}`")),
        }
    }
}

/// The lifecycle edge an exchange event asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeTransition {
    Offer,
    Fund,
    Dispute,
    Resolve,
    /// Records the refund signer; leaves the state at `Resolved`.
    Refund,
    Complete,
    Void,
}

impl ExchangeTransition {
    /// State this transition moves to, or `None` for `Refund`.
    pub fn target(&self) -> Option<ExchangeState> {
        match self {
            Self::Offer => Some(ExchangeState::Offered),
            Self::Fund => Some(ExchangeState::Funded),
            Self::Dispute => Some(ExchangeState::Disputed),
            Self::Resolve => Some(ExchangeState::Resolved),
            Self::Refund => None,
            Self::Complete => Some(ExchangeState::Completed),
            Self::Void => Some(ExchangeState::Voided),
        }
    }
}

impl fmt::Display for ExchangeTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Offer => "offer",
            Self::Fund => "fund",
            Self::Dispute => "dispute",
            Self::Resolve => "resolve",
            Self::Refund => "refund",
            Self::Complete => "complete",
            Self::Void => "void",
        };
        f.write_str(name)
    }
}

/// A transition that is not an outgoing edge of the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cannot {transition} an exchange in state {from}")]
pub struct IllegalTransition {
    pub from: ExchangeState,
    pub transition: ExchangeTransition,
}

/// Compute the state an exchange moves to.
///
/// With no prior record every transition succeeds and the exchange starts
/// out `Offered`, whichever event happened to arrive first. With a prior
/// record only the lifecycle edges are legal, plus the self-loop of
/// re-delivering the event that produced the current state.
///
/// # Errors
///
/// Returns [`IllegalTransition`] when `transition` is not an outgoing edge
/// of `current`.
pub fn next_state(
    current: Option<ExchangeState>,
    transition: ExchangeTransition,
) -> Result<ExchangeState, IllegalTransition> {
    use ExchangeState::{Completed, Disputed, Funded, Offered, Resolved, Voided};
    use ExchangeTransition as T;

    let Some(from) = current else {
        return Ok(Offered);
    };

    if transition.target() == Some(from) {
        return Ok(from);
    }

    match (from, transition) {
        (Offered, T::Fund) => Ok(Funded),
        (Funded, T::Dispute) => Ok(Disputed),
        (Disputed, T::Resolve) => Ok(Resolved),
        (Resolved, T::Refund) => Ok(Resolved),
        (Funded | Resolved, T::Complete) => Ok(Completed),
        (Funded | Resolved, T::Void) => Ok(Voided),
        _ => Err(IllegalTransition { from, transition }),
    }
}

// ---------------------------------------------------------------------------
// Exchange
// ---------------------------------------------------------------------------

/// A purchase of a service between a buyer and a seller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExchangeRecord {
    pub id: u64,
    pub when: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_id: Option<u64>,
    pub state: ExchangeState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buyer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seller: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub moderator: Option<String>,
    pub price: u64,
    pub refund_type: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signer: Option<String>,
}

/// Fields an exchange event may carry.
///
/// `state` is only checked against the event kind by the classifier; the
/// stored state is always derived through [`next_state`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangePatch {
    pub when: Option<u64>,
    pub uri: Option<String>,
    pub service_id: Option<u64>,
    pub state: Option<ExchangeState>,
    pub buyer: Option<String>,
    pub seller: Option<String>,
    pub moderator: Option<String>,
    pub price: Option<u64>,
    pub refund_type: Option<u8>,
    pub signer: Option<String>,
}

/// A classified exchange event: the requested lifecycle edge plus its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeUpdate {
    pub transition: ExchangeTransition,
    pub patch: ExchangePatch,
}

impl ExchangeRecord {
    fn merge(&mut self, patch: ExchangePatch) {
        overlay(&mut self.when, patch.when);
        overlay_opt(&mut self.uri, patch.uri);
        overlay_opt(&mut self.service_id, patch.service_id);
        overlay_opt(&mut self.buyer, patch.buyer);
        overlay_opt(&mut self.seller, patch.seller);
        overlay_opt(&mut self.moderator, patch.moderator);
        overlay(&mut self.price, patch.price);
        overlay(&mut self.refund_type, patch.refund_type);
        overlay_opt(&mut self.signer, patch.signer);
    }
}

impl Record for ExchangeRecord {
    const TABLE: &'static str = "exchange";

    type Update = ExchangeUpdate;

    fn create(id: u64) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn when(&self) -> u64 {
        self.when
    }

    fn update_when(update: &ExchangeUpdate) -> Option<u64> {
        update.patch.when
    }

    fn reconcile(
        current: Option<&Self>,
        id: u64,
        update: ExchangeUpdate,
    ) -> Result<Self, Rejection> {
        let ExchangeUpdate { transition, patch } = update;
        let state = next_state(current.map(|r| r.state), transition)?;

        let mut record = match current {
            Some(stored) => {
                if let (Some(existing), Some(incoming)) = (stored.service_id, patch.service_id)
                    && existing != incoming
                {
                    return Err(Rejection::Validation(format!(
                        "serviceId is immutable: stored {existing}, event carries {incoming}"
                    )));
                }
                stored.clone()
            }
            None => Self::create(id),
        };

        record.merge(patch);
        record.state = state;
        Ok(record)
    }
}
