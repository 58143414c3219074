//! Inter-department message envelope
//!
//! A message is a header (id, type, sender, recipient, timestamp, priority)
//! plus a typed payload. Payloads are a tagged union keyed on the message
//! type; raw documents coming off the transport are decoded and validated at
//! the consumer before dispatch.

use crate::domain::entities::candidate::Candidate;
use crate::domain::entities::position::ExitReason;
use crate::domain::errors::ValidationError;
use crate::domain::value_objects::{price::Price, shares::Shares};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

/// Independently scheduled decision-making component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Department {
    Research,
    Risk,
    Compliance,
    Portfolio,
    Trading,
    Executive,
}

impl Department {
    pub fn as_str(&self) -> &'static str {
        match self {
            Department::Research => "research",
            Department::Risk => "risk",
            Department::Compliance => "compliance",
            Department::Portfolio => "portfolio",
            Department::Trading => "trading",
            Department::Executive => "executive",
        }
    }
}

impl fmt::Display for Department {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Department {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "research" => Ok(Department::Research),
            "risk" => Ok(Department::Risk),
            "compliance" => Ok(Department::Compliance),
            "portfolio" => Ok(Department::Portfolio),
            "trading" => Ok(Department::Trading),
            "executive" => Ok(Department::Executive),
            other => Err(ValidationError::InvalidPayload(format!(
                "unknown department '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

impl FromStr for Priority {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            other => Err(ValidationError::InvalidPayload(format!(
                "unknown priority '{}'",
                other
            ))),
        }
    }
}

/// Closed set of message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    CandidateRequest,
    CandidateList,
    TradeProposal,
    TradeApproval,
    TradeRejection,
    BuyOrder,
    FillConfirmation,
    OrderCancellation,
    ExitSignal,
    DailyReport,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::CandidateRequest => "CandidateRequest",
            MessageType::CandidateList => "CandidateList",
            MessageType::TradeProposal => "TradeProposal",
            MessageType::TradeApproval => "TradeApproval",
            MessageType::TradeRejection => "TradeRejection",
            MessageType::BuyOrder => "BuyOrder",
            MessageType::FillConfirmation => "FillConfirmation",
            MessageType::OrderCancellation => "OrderCancellation",
            MessageType::ExitSignal => "ExitSignal",
            MessageType::DailyReport => "DailyReport",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = match s {
            "CandidateRequest" => MessageType::CandidateRequest,
            "CandidateList" => MessageType::CandidateList,
            "TradeProposal" => MessageType::TradeProposal,
            "TradeApproval" => MessageType::TradeApproval,
            "TradeRejection" => MessageType::TradeRejection,
            "BuyOrder" => MessageType::BuyOrder,
            "FillConfirmation" => MessageType::FillConfirmation,
            "OrderCancellation" => MessageType::OrderCancellation,
            "ExitSignal" => MessageType::ExitSignal,
            "DailyReport" => MessageType::DailyReport,
            other => {
                return Err(ValidationError::InvalidPayload(format!(
                    "unknown message type '{}'",
                    other
                )))
            }
        };
        Ok(parsed)
    }
}

/// Portfolio → Research: ask for new candidates when under-deployed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRequest {
    pub available_positions: u32,
    pub available_capital: f64,
    pub min_composite_score: f64,
    pub max_candidates: u32,
    pub sector_diversification: bool,
    #[serde(default)]
    pub excluded_sectors: Vec<String>,
    pub deployment_pct: f64,
}

/// Research → Portfolio: scored candidates answering a CandidateRequest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateList {
    #[serde(default)]
    pub request_id: Option<String>,
    pub candidates: Vec<Candidate>,
}

/// Portfolio → Compliance: a sized trade awaiting approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeProposal {
    pub ticker: String,
    #[serde(default)]
    pub sector: Option<String>,
    pub shares: i64,
    pub entry_price: f64,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub target: Option<f64>,
    pub composite_score: f64,
    pub target_value: f64,
}

/// Compliance → Portfolio: the proposal passed every rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeApproval {
    pub proposal_id: String,
    pub ticker: String,
    #[serde(default)]
    pub sector: Option<String>,
    pub shares: i64,
    pub entry_price: f64,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub target: Option<f64>,
    pub validation_status: String,
    #[serde(default)]
    pub risk_assessment_id: Option<String>,
}

/// Compliance → Portfolio: the proposal was refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRejection {
    pub proposal_id: String,
    pub ticker: String,
    pub validation_status: String,
    pub rejection_reason: String,
    pub rejection_category: String,
}

/// Portfolio → Trading: submit an order for a PENDING position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuyOrder {
    pub position_id: String,
    pub ticker: String,
    pub shares: i64,
    pub limit_price: f64,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub target: Option<f64>,
}

/// Trading → Portfolio: the broker filled (fully or partially) an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillConfirmation {
    pub position_id: String,
    pub ticker: String,
    pub filled_shares: i64,
    pub fill_price: f64,
    pub fill_date: DateTime<Utc>,
}

/// Trading → Portfolio: the broker cancelled or refused an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCancellation {
    pub position_id: String,
    pub ticker: String,
    pub reason: String,
}

/// Trading/Risk → Portfolio: a position was exited at the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitSignal {
    pub position_id: String,
    pub ticker: String,
    pub exit_price: f64,
    pub exit_date: DateTime<Utc>,
    pub reason: ExitReason,
}

/// Portfolio → Executive: end-of-cycle summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyReport {
    pub pending: u32,
    pub open: u32,
    pub closed: u32,
    pub rejected: u32,
    pub capital_deployed: f64,
    pub realized_pnl: f64,
    /// Absent when no valuation was available this cycle
    #[serde(default)]
    pub deployment_pct: Option<f64>,
    pub approvals: u64,
    pub rejections: u64,
    pub fills: u64,
    pub exits: u64,
    pub anomalies: u64,
    #[serde(default)]
    pub reconciliation_anomalies: u64,
}

/// Typed payload, tagged by message type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Payload {
    CandidateRequest(CandidateRequest),
    CandidateList(CandidateList),
    TradeProposal(TradeProposal),
    TradeApproval(TradeApproval),
    TradeRejection(TradeRejection),
    BuyOrder(BuyOrder),
    FillConfirmation(FillConfirmation),
    OrderCancellation(OrderCancellation),
    ExitSignal(ExitSignal),
    DailyReport(DailyReport),
}

fn require_ticker(ticker: &str) -> Result<(), ValidationError> {
    if ticker.trim().is_empty() {
        return Err(ValidationError::InvalidTicker("ticker is empty".to_string()));
    }
    Ok(())
}

fn require_optional_price(value: Option<f64>) -> Result<(), ValidationError> {
    if let Some(v) = value {
        Price::new(v)?;
    }
    Ok(())
}

fn require_non_negative(value: f64) -> Result<(), ValidationError> {
    if !value.is_finite() {
        return Err(ValidationError::MustBeFinite);
    }
    if value < 0.0 {
        return Err(ValidationError::MustBeNonNegative);
    }
    Ok(())
}

impl Payload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::CandidateRequest(_) => MessageType::CandidateRequest,
            Payload::CandidateList(_) => MessageType::CandidateList,
            Payload::TradeProposal(_) => MessageType::TradeProposal,
            Payload::TradeApproval(_) => MessageType::TradeApproval,
            Payload::TradeRejection(_) => MessageType::TradeRejection,
            Payload::BuyOrder(_) => MessageType::BuyOrder,
            Payload::FillConfirmation(_) => MessageType::FillConfirmation,
            Payload::OrderCancellation(_) => MessageType::OrderCancellation,
            Payload::ExitSignal(_) => MessageType::ExitSignal,
            Payload::DailyReport(_) => MessageType::DailyReport,
        }
    }

    /// Value-level checks beyond what deserialization enforces.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Payload::CandidateRequest(req) => {
                require_non_negative(req.available_capital)?;
                require_non_negative(req.min_composite_score)?;
            }
            Payload::CandidateList(list) => {
                for candidate in &list.candidates {
                    candidate.validate()?;
                }
            }
            Payload::TradeProposal(p) => {
                require_ticker(&p.ticker)?;
                Shares::new(p.shares)?;
                Price::new(p.entry_price)?;
                require_optional_price(p.stop_loss)?;
                require_optional_price(p.target)?;
                require_non_negative(p.target_value)?;
            }
            Payload::TradeApproval(a) => {
                require_ticker(&a.ticker)?;
                Shares::new(a.shares)?;
                Price::new(a.entry_price)?;
                require_optional_price(a.stop_loss)?;
                require_optional_price(a.target)?;
            }
            Payload::TradeRejection(r) => {
                require_ticker(&r.ticker)?;
            }
            Payload::BuyOrder(o) => {
                require_ticker(&o.ticker)?;
                Shares::new(o.shares)?;
                Price::new(o.limit_price)?;
            }
            Payload::FillConfirmation(f) => {
                require_ticker(&f.ticker)?;
                Shares::new(f.filled_shares)?;
                Price::new(f.fill_price)?;
            }
            Payload::OrderCancellation(c) => {
                require_ticker(&c.ticker)?;
            }
            Payload::ExitSignal(e) => {
                require_ticker(&e.ticker)?;
                Price::new(e.exit_price)?;
            }
            Payload::DailyReport(_) => {}
        }
        Ok(())
    }

    /// Splits the payload into its type tag and JSON body.
    pub fn encode(&self) -> Result<(MessageType, serde_json::Value), ValidationError> {
        let mut tagged = serde_json::to_value(self)
            .map_err(|e| ValidationError::InvalidPayload(e.to_string()))?;
        let body = tagged
            .get_mut("payload")
            .map(serde_json::Value::take)
            .unwrap_or(serde_json::Value::Null);
        Ok((self.message_type(), body))
    }

    /// Rebuilds a payload from its type tag and JSON body.
    pub fn decode(message_type: &str, body: &serde_json::Value) -> Result<Self, ValidationError> {
        MessageType::from_str(message_type)?;
        let tagged = serde_json::json!({ "type": message_type, "payload": body });
        let payload: Payload = serde_json::from_value(tagged).map_err(|e| {
            ValidationError::InvalidPayload(format!("{} body: {}", message_type, e))
        })?;
        payload.validate()?;
        Ok(payload)
    }
}

/// A message before the bus has assigned it an id.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub sender: Department,
    pub recipient: Department,
    pub priority: Priority,
    pub causation_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub payload: Payload,
}

impl OutboundMessage {
    pub fn new(sender: Department, recipient: Department, payload: Payload) -> Self {
        Self {
            sender,
            recipient,
            priority: Priority::Normal,
            causation_id: None,
            idempotency_key: None,
            payload,
        }
    }

    pub fn high_priority(mut self) -> Self {
        self.priority = Priority::High;
        self
    }

    /// Records the inbound message that produced this one.
    pub fn caused_by(mut self, message_id: &str) -> Self {
        self.causation_id = Some(message_id.to_string());
        self
    }

    /// A second send with the same key is absorbed by the bus.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    /// Validates the message and renders it as a transport document.
    pub fn to_document(&self) -> Result<MessageDocument, ValidationError> {
        if self.sender == self.recipient {
            return Err(ValidationError::SelfAddressed(self.sender.to_string()));
        }
        self.payload.validate()?;
        let (message_type, body) = self.payload.encode()?;
        Ok(MessageDocument {
            message_type: message_type.as_str().to_string(),
            sender: self.sender.as_str().to_string(),
            recipient: self.recipient.as_str().to_string(),
            priority: self.priority.as_str().to_string(),
            causation_id: self.causation_id.clone(),
            idempotency_key: self.idempotency_key.clone(),
            body,
        })
    }
}

/// Transport form: metadata header plus an undecoded JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDocument {
    pub message_type: String,
    pub sender: String,
    pub recipient: String,
    pub priority: String,
    pub causation_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub body: serde_json::Value,
}

impl MessageDocument {
    /// Header checks applied when a document enters the bus. The body is
    /// left for the consumer to decode.
    pub fn validate_header(&self) -> Result<Department, ValidationError> {
        let sender = Department::from_str(&self.sender)?;
        let recipient = Department::from_str(&self.recipient)?;
        if sender == recipient {
            return Err(ValidationError::SelfAddressed(self.sender.clone()));
        }
        Priority::from_str(&self.priority)?;
        if self.message_type.trim().is_empty() {
            return Err(ValidationError::InvalidPayload(
                "message type is empty".to_string(),
            ));
        }
        Ok(recipient)
    }
}

/// A document as held by the durable store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub document: MessageDocument,
}

impl StoredMessage {
    pub fn decode(&self) -> Inbound {
        match self.try_decode() {
            Ok(message) => Inbound::Valid(message),
            Err(error) => Inbound::Malformed {
                id: self.id.clone(),
                sender: self.document.sender.clone(),
                message_type: self.document.message_type.clone(),
                error,
            },
        }
    }

    fn try_decode(&self) -> Result<Message, ValidationError> {
        let doc = &self.document;
        Ok(Message {
            id: self.id.clone(),
            sender: Department::from_str(&doc.sender)?,
            recipient: Department::from_str(&doc.recipient)?,
            created_at: self.created_at,
            priority: Priority::from_str(&doc.priority)?,
            causation_id: doc.causation_id.clone(),
            payload: Payload::decode(&doc.message_type, &doc.body)?,
        })
    }
}

/// A delivered, decoded message. Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub sender: Department,
    pub recipient: Department,
    pub created_at: DateTime<Utc>,
    pub priority: Priority,
    pub causation_id: Option<String>,
    pub payload: Payload,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }
}

/// What a consumer gets from `receive`: a decoded message or a document that
/// failed decoding and must be left pending for manual review.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Valid(Message),
    Malformed {
        id: String,
        sender: String,
        message_type: String,
        error: ValidationError,
    },
}

impl Inbound {
    pub fn id(&self) -> &str {
        match self {
            Inbound::Valid(message) => &message.id,
            Inbound::Malformed { id, .. } => id,
        }
    }
}

/// Generates ids of the form `{unix_millis:013}-{sequence:06}-{node:08x}`.
///
/// Ids sort lexicographically by creation time; the sequence breaks ties
/// within a millisecond and never goes backwards even if the clock does.
#[derive(Debug)]
pub struct MessageIdGenerator {
    node: u32,
    state: Mutex<(i64, u32)>,
}

impl MessageIdGenerator {
    pub fn new() -> Self {
        Self::with_node(rand::thread_rng().gen())
    }

    pub fn with_node(node: u32) -> Self {
        Self {
            node,
            state: Mutex::new((0, 0)),
        }
    }

    pub fn next_id(&self, now: DateTime<Utc>) -> String {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let millis = now.timestamp_millis().max(state.0);
        if millis == state.0 {
            state.1 += 1;
        } else {
            *state = (millis, 0);
        }
        format!("{:013}-{:06}-{:08x}", state.0, state.1, self.node)
    }
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
