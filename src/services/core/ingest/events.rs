// Typed upstream events: tagged-union decoding keyed on `eventType`, the
// event -> template mapping, and the per-event fallback formatters.

use crate::services::core::notification::template_store::TemplateStore;
use crate::types::{Channel, DispatchRequest, Priority, TemplateCategory};
use crate::utils::{NotifyError, NotifyResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Every upstream event type the ingestors understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    OrderPlaced,
    OrderFilled,
    OrderCancelled,
    OrderRejected,
    DepositCompleted,
    WithdrawalCompleted,
    PaymentFailed,
    ProfileUpdated,
    EmailVerified,
    KycSubmitted,
    KycVerified,
    SuspiciousLogin,
    PasswordChanged,
    TwoFaEnabled,
    BalanceUpdated,
    PositionClosed,
    PerformanceAlert,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::OrderPlaced => "ORDER_PLACED",
            EventKind::OrderFilled => "ORDER_FILLED",
            EventKind::OrderCancelled => "ORDER_CANCELLED",
            EventKind::OrderRejected => "ORDER_REJECTED",
            EventKind::DepositCompleted => "DEPOSIT_COMPLETED",
            EventKind::WithdrawalCompleted => "WITHDRAWAL_COMPLETED",
            EventKind::PaymentFailed => "PAYMENT_FAILED",
            EventKind::ProfileUpdated => "PROFILE_UPDATED",
            EventKind::EmailVerified => "EMAIL_VERIFIED",
            EventKind::KycSubmitted => "KYC_SUBMITTED",
            EventKind::KycVerified => "KYC_VERIFIED",
            EventKind::SuspiciousLogin => "SUSPICIOUS_LOGIN",
            EventKind::PasswordChanged => "PASSWORD_CHANGED",
            EventKind::TwoFaEnabled => "TWO_FA_ENABLED",
            EventKind::BalanceUpdated => "BALANCE_UPDATED",
            EventKind::PositionClosed => "POSITION_CLOSED",
            EventKind::PerformanceAlert => "PERFORMANCE_ALERT",
        }
    }

    pub fn all() -> &'static [EventKind] {
        &[
            EventKind::OrderPlaced,
            EventKind::OrderFilled,
            EventKind::OrderCancelled,
            EventKind::OrderRejected,
            EventKind::DepositCompleted,
            EventKind::WithdrawalCompleted,
            EventKind::PaymentFailed,
            EventKind::ProfileUpdated,
            EventKind::EmailVerified,
            EventKind::KycSubmitted,
            EventKind::KycVerified,
            EventKind::SuspiciousLogin,
            EventKind::PasswordChanged,
            EventKind::TwoFaEnabled,
            EventKind::BalanceUpdated,
            EventKind::PositionClosed,
            EventKind::PerformanceAlert,
        ]
    }

    /// Dispatch priority derived from the event type.
    pub fn priority(&self) -> Priority {
        match self {
            EventKind::SuspiciousLogin => Priority::Urgent,
            EventKind::OrderRejected | EventKind::PaymentFailed => Priority::High,
            EventKind::PasswordChanged | EventKind::TwoFaEnabled => Priority::High,
            EventKind::BalanceUpdated | EventKind::PerformanceAlert => Priority::Low,
            _ => Priority::Medium,
        }
    }

    pub fn category(&self) -> TemplateCategory {
        match self {
            EventKind::OrderPlaced
            | EventKind::OrderFilled
            | EventKind::OrderCancelled
            | EventKind::OrderRejected
            | EventKind::BalanceUpdated
            | EventKind::PositionClosed
            | EventKind::PerformanceAlert => TemplateCategory::Trading,
            EventKind::DepositCompleted
            | EventKind::WithdrawalCompleted
            | EventKind::PaymentFailed
            | EventKind::ProfileUpdated
            | EventKind::EmailVerified
            | EventKind::KycSubmitted
            | EventKind::KycVerified => TemplateCategory::Account,
            EventKind::SuspiciousLogin
            | EventKind::PasswordChanged
            | EventKind::TwoFaEnabled => TemplateCategory::Security,
        }
    }

    /// Canonical template backing this event, when one exists.
    pub fn template_name(&self) -> Option<&'static str> {
        match self {
            EventKind::OrderFilled => Some("order_execution_alert"),
            EventKind::OrderCancelled => Some("order_cancelled_alert"),
            EventKind::OrderRejected => Some("order_rejected_alert"),
            EventKind::DepositCompleted => Some("deposit_completed_alert"),
            EventKind::WithdrawalCompleted => Some("withdrawal_completed_alert"),
            EventKind::PaymentFailed => Some("payment_failed_alert"),
            EventKind::SuspiciousLogin
            | EventKind::PasswordChanged
            | EventKind::TwoFaEnabled => Some("security_alert"),
            EventKind::KycSubmitted | EventKind::KycVerified => Some("kyc_status_alert"),
            EventKind::BalanceUpdated => Some("balance_updated_alert"),
            EventKind::PositionClosed => Some("position_closed_alert"),
            EventKind::PerformanceAlert => Some("performance_alert"),
            EventKind::OrderPlaced | EventKind::ProfileUpdated | EventKind::EmailVerified => None,
        }
    }

    /// Events whose dead-lettered failures page an operator.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            EventKind::OrderRejected | EventKind::SuspiciousLogin | EventKind::PaymentFailed
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = NotifyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::all()
            .iter()
            .find(|kind| kind.as_str() == s)
            .copied()
            .ok_or_else(|| NotifyError::parse_error(format!("Unknown event type: {}", s)))
    }
}

// ============= PAYLOADS =============

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderEvent {
    pub user_email: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub order_id: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub filled_quantity: Option<f64>,
    #[serde(default)]
    pub avg_execution_price: Option<f64>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentEvent {
    pub user_email: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub payment_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileEvent {
    pub user_email: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub field: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityEvent {
    pub user_email: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub device: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioEvent {
    pub user_email: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub balance: Option<f64>,
    #[serde(default)]
    pub pnl: Option<f64>,
    #[serde(default)]
    pub period: Option<String>,
    #[serde(default)]
    pub change_percent: Option<f64>,
}

/// One decoded upstream event.
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    OrderPlaced(OrderEvent),
    OrderFilled(OrderEvent),
    OrderCancelled(OrderEvent),
    OrderRejected(OrderEvent),
    DepositCompleted(PaymentEvent),
    WithdrawalCompleted(PaymentEvent),
    PaymentFailed(PaymentEvent),
    ProfileUpdated(ProfileEvent),
    EmailVerified(ProfileEvent),
    KycSubmitted(ProfileEvent),
    KycVerified(ProfileEvent),
    SuspiciousLogin(SecurityEvent),
    PasswordChanged(SecurityEvent),
    TwoFaEnabled(SecurityEvent),
    BalanceUpdated(PortfolioEvent),
    PositionClosed(PortfolioEvent),
    PerformanceAlert(PortfolioEvent),
}

/// Decode the type-specific payload for an already-extracted event type.
pub fn decode_event(kind: EventKind, payload: &serde_json::Value) -> NotifyResult<UpstreamEvent> {
    let value = payload.clone();
    let event = match kind {
        EventKind::OrderPlaced => UpstreamEvent::OrderPlaced(serde_json::from_value(value)?),
        EventKind::OrderFilled => UpstreamEvent::OrderFilled(serde_json::from_value(value)?),
        EventKind::OrderCancelled => UpstreamEvent::OrderCancelled(serde_json::from_value(value)?),
        EventKind::OrderRejected => UpstreamEvent::OrderRejected(serde_json::from_value(value)?),
        EventKind::DepositCompleted => {
            UpstreamEvent::DepositCompleted(serde_json::from_value(value)?)
        }
        EventKind::WithdrawalCompleted => {
            UpstreamEvent::WithdrawalCompleted(serde_json::from_value(value)?)
        }
        EventKind::PaymentFailed => UpstreamEvent::PaymentFailed(serde_json::from_value(value)?),
        EventKind::ProfileUpdated => UpstreamEvent::ProfileUpdated(serde_json::from_value(value)?),
        EventKind::EmailVerified => UpstreamEvent::EmailVerified(serde_json::from_value(value)?),
        EventKind::KycSubmitted => UpstreamEvent::KycSubmitted(serde_json::from_value(value)?),
        EventKind::KycVerified => UpstreamEvent::KycVerified(serde_json::from_value(value)?),
        EventKind::SuspiciousLogin => {
            UpstreamEvent::SuspiciousLogin(serde_json::from_value(value)?)
        }
        EventKind::PasswordChanged => {
            UpstreamEvent::PasswordChanged(serde_json::from_value(value)?)
        }
        EventKind::TwoFaEnabled => UpstreamEvent::TwoFaEnabled(serde_json::from_value(value)?),
        EventKind::BalanceUpdated => UpstreamEvent::BalanceUpdated(serde_json::from_value(value)?),
        EventKind::PositionClosed => UpstreamEvent::PositionClosed(serde_json::from_value(value)?),
        EventKind::PerformanceAlert => {
            UpstreamEvent::PerformanceAlert(serde_json::from_value(value)?)
        }
    };
    Ok(event)
}

fn fmt_num(value: f64) -> String {
    format!("{}", value)
}

impl UpstreamEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            UpstreamEvent::OrderPlaced(_) => EventKind::OrderPlaced,
            UpstreamEvent::OrderFilled(_) => EventKind::OrderFilled,
            UpstreamEvent::OrderCancelled(_) => EventKind::OrderCancelled,
            UpstreamEvent::OrderRejected(_) => EventKind::OrderRejected,
            UpstreamEvent::DepositCompleted(_) => EventKind::DepositCompleted,
            UpstreamEvent::WithdrawalCompleted(_) => EventKind::WithdrawalCompleted,
            UpstreamEvent::PaymentFailed(_) => EventKind::PaymentFailed,
            UpstreamEvent::ProfileUpdated(_) => EventKind::ProfileUpdated,
            UpstreamEvent::EmailVerified(_) => EventKind::EmailVerified,
            UpstreamEvent::KycSubmitted(_) => EventKind::KycSubmitted,
            UpstreamEvent::KycVerified(_) => EventKind::KycVerified,
            UpstreamEvent::SuspiciousLogin(_) => EventKind::SuspiciousLogin,
            UpstreamEvent::PasswordChanged(_) => EventKind::PasswordChanged,
            UpstreamEvent::TwoFaEnabled(_) => EventKind::TwoFaEnabled,
            UpstreamEvent::BalanceUpdated(_) => EventKind::BalanceUpdated,
            UpstreamEvent::PositionClosed(_) => EventKind::PositionClosed,
            UpstreamEvent::PerformanceAlert(_) => EventKind::PerformanceAlert,
        }
    }

    pub fn user_email(&self) -> &str {
        match self {
            UpstreamEvent::OrderPlaced(e)
            | UpstreamEvent::OrderFilled(e)
            | UpstreamEvent::OrderCancelled(e)
            | UpstreamEvent::OrderRejected(e) => &e.user_email,
            UpstreamEvent::DepositCompleted(e)
            | UpstreamEvent::WithdrawalCompleted(e)
            | UpstreamEvent::PaymentFailed(e) => &e.user_email,
            UpstreamEvent::ProfileUpdated(e)
            | UpstreamEvent::EmailVerified(e)
            | UpstreamEvent::KycSubmitted(e)
            | UpstreamEvent::KycVerified(e) => &e.user_email,
            UpstreamEvent::SuspiciousLogin(e)
            | UpstreamEvent::PasswordChanged(e)
            | UpstreamEvent::TwoFaEnabled(e) => &e.user_email,
            UpstreamEvent::BalanceUpdated(e)
            | UpstreamEvent::PositionClosed(e)
            | UpstreamEvent::PerformanceAlert(e) => &e.user_email,
        }
    }

    pub fn user_name(&self) -> &str {
        match self {
            UpstreamEvent::OrderPlaced(e)
            | UpstreamEvent::OrderFilled(e)
            | UpstreamEvent::OrderCancelled(e)
            | UpstreamEvent::OrderRejected(e) => &e.user_name,
            UpstreamEvent::DepositCompleted(e)
            | UpstreamEvent::WithdrawalCompleted(e)
            | UpstreamEvent::PaymentFailed(e) => &e.user_name,
            UpstreamEvent::ProfileUpdated(e)
            | UpstreamEvent::EmailVerified(e)
            | UpstreamEvent::KycSubmitted(e)
            | UpstreamEvent::KycVerified(e) => &e.user_name,
            UpstreamEvent::SuspiciousLogin(e)
            | UpstreamEvent::PasswordChanged(e)
            | UpstreamEvent::TwoFaEnabled(e) => &e.user_name,
            UpstreamEvent::BalanceUpdated(e)
            | UpstreamEvent::PositionClosed(e)
            | UpstreamEvent::PerformanceAlert(e) => &e.user_name,
        }
    }

    /// Template variables in the string form templates substitute.
    pub fn template_variables(&self) -> HashMap<String, String> {
        let mut vars = HashMap::new();
        vars.insert("user_name".to_string(), self.user_name().to_string());
        match self {
            UpstreamEvent::OrderPlaced(e)
            | UpstreamEvent::OrderFilled(e)
            | UpstreamEvent::OrderCancelled(e)
            | UpstreamEvent::OrderRejected(e) => {
                vars.insert("order_id".to_string(), e.order_id.clone());
                vars.insert("symbol".to_string(), e.symbol.clone());
                if let Some(quantity) = e.quantity {
                    vars.insert("quantity".to_string(), fmt_num(quantity));
                }
                if let Some(filled) = e.filled_quantity {
                    vars.insert("filled_quantity".to_string(), fmt_num(filled));
                }
                if let Some(price) = e.avg_execution_price {
                    vars.insert("avg_execution_price".to_string(), fmt_num(price));
                }
                if let Some(reason) = &e.reason {
                    vars.insert("reason".to_string(), reason.clone());
                }
            }
            UpstreamEvent::DepositCompleted(e)
            | UpstreamEvent::WithdrawalCompleted(e)
            | UpstreamEvent::PaymentFailed(e) => {
                if let Some(amount) = e.amount {
                    vars.insert("amount".to_string(), fmt_num(amount));
                }
                if let Some(currency) = &e.currency {
                    vars.insert("currency".to_string(), currency.clone());
                }
                if let Some(payment_id) = &e.payment_id {
                    vars.insert("payment_id".to_string(), payment_id.clone());
                }
                if let Some(reason) = &e.reason {
                    vars.insert("reason".to_string(), reason.clone());
                }
            }
            UpstreamEvent::ProfileUpdated(e)
            | UpstreamEvent::EmailVerified(e)
            | UpstreamEvent::KycSubmitted(e)
            | UpstreamEvent::KycVerified(e) => {
                if let Some(status) = &e.status {
                    vars.insert("status".to_string(), status.clone());
                }
                if let Some(field) = &e.field {
                    vars.insert("field".to_string(), field.clone());
                }
            }
            UpstreamEvent::SuspiciousLogin(e)
            | UpstreamEvent::PasswordChanged(e)
            | UpstreamEvent::TwoFaEnabled(e) => {
                vars.insert("event".to_string(), self.security_event_label().to_string());
                vars.insert(
                    "ip_address".to_string(),
                    e.ip_address.clone().unwrap_or_else(|| "unknown".to_string()),
                );
                vars.insert(
                    "location".to_string(),
                    e.location.clone().unwrap_or_else(|| "unknown".to_string()),
                );
            }
            UpstreamEvent::BalanceUpdated(e)
            | UpstreamEvent::PositionClosed(e)
            | UpstreamEvent::PerformanceAlert(e) => {
                if let Some(symbol) = &e.symbol {
                    vars.insert("symbol".to_string(), symbol.clone());
                }
                if let Some(balance) = e.balance {
                    vars.insert("balance".to_string(), fmt_num(balance));
                }
                if let Some(pnl) = e.pnl {
                    vars.insert("pnl".to_string(), fmt_num(pnl));
                }
                if let Some(period) = &e.period {
                    vars.insert("period".to_string(), period.clone());
                }
                if let Some(change) = e.change_percent {
                    vars.insert("change_percent".to_string(), fmt_num(change));
                }
            }
        }
        vars
    }

    fn security_event_label(&self) -> &'static str {
        match self.kind() {
            EventKind::SuspiciousLogin => "Suspicious login",
            EventKind::PasswordChanged => "Password changed",
            EventKind::TwoFaEnabled => "Two-factor authentication enabled",
            _ => "Security event",
        }
    }

    /// Human-readable fallback subject when no active template exists.
    pub fn fallback_subject(&self) -> String {
        let vars = self.template_variables();
        match self.kind() {
            EventKind::OrderPlaced => format!(
                "Order placed: {}",
                vars.get("symbol").cloned().unwrap_or_default()
            ),
            EventKind::OrderFilled => format!(
                "Order filled: {} at {}",
                vars.get("symbol").cloned().unwrap_or_default(),
                vars.get("avg_execution_price").cloned().unwrap_or_default()
            ),
            EventKind::OrderCancelled => format!(
                "Order cancelled: {}",
                vars.get("symbol").cloned().unwrap_or_default()
            ),
            EventKind::OrderRejected => format!(
                "Order rejected: {}",
                vars.get("symbol").cloned().unwrap_or_default()
            ),
            EventKind::DepositCompleted => "Deposit completed".to_string(),
            EventKind::WithdrawalCompleted => "Withdrawal completed".to_string(),
            EventKind::PaymentFailed => "Payment failed".to_string(),
            EventKind::ProfileUpdated => "Profile updated".to_string(),
            EventKind::EmailVerified => "Email address verified".to_string(),
            EventKind::KycSubmitted => "Identity verification submitted".to_string(),
            EventKind::KycVerified => "Identity verified".to_string(),
            EventKind::SuspiciousLogin
            | EventKind::PasswordChanged
            | EventKind::TwoFaEnabled => {
                format!("SECURITY ALERT: {}", self.security_event_label())
            }
            EventKind::BalanceUpdated => "Balance updated".to_string(),
            EventKind::PositionClosed => "Position closed".to_string(),
            EventKind::PerformanceAlert => "Portfolio performance update".to_string(),
        }
    }

    /// Human-readable fallback body assembled from the event fields.
    pub fn fallback_content(&self) -> String {
        let vars = self.template_variables();
        let name = self.user_name();
        let greeting = if name.is_empty() {
            "Hi,".to_string()
        } else {
            format!("Hi {},", name)
        };

        let detail = match self.kind() {
            EventKind::OrderPlaced | EventKind::OrderFilled => format!(
                "your order {} for {} {} executed at {}.",
                vars.get("order_id").cloned().unwrap_or_default(),
                vars.get("filled_quantity")
                    .or(vars.get("quantity"))
                    .cloned()
                    .unwrap_or_default(),
                vars.get("symbol").cloned().unwrap_or_default(),
                vars.get("avg_execution_price").cloned().unwrap_or_default()
            ),
            EventKind::OrderCancelled => format!(
                "your order {} for {} was cancelled.",
                vars.get("order_id").cloned().unwrap_or_default(),
                vars.get("symbol").cloned().unwrap_or_default()
            ),
            EventKind::OrderRejected => format!(
                "your order {} for {} was rejected: {}.",
                vars.get("order_id").cloned().unwrap_or_default(),
                vars.get("symbol").cloned().unwrap_or_default(),
                vars.get("reason").cloned().unwrap_or_else(|| "unspecified".to_string())
            ),
            EventKind::DepositCompleted => format!(
                "your deposit of {} {} has completed.",
                vars.get("amount").cloned().unwrap_or_default(),
                vars.get("currency").cloned().unwrap_or_default()
            ),
            EventKind::WithdrawalCompleted => format!(
                "your withdrawal of {} {} has completed.",
                vars.get("amount").cloned().unwrap_or_default(),
                vars.get("currency").cloned().unwrap_or_default()
            ),
            EventKind::PaymentFailed => format!(
                "your payment of {} {} failed: {}.",
                vars.get("amount").cloned().unwrap_or_default(),
                vars.get("currency").cloned().unwrap_or_default(),
                vars.get("reason").cloned().unwrap_or_else(|| "unspecified".to_string())
            ),
            EventKind::ProfileUpdated => "your profile was updated.".to_string(),
            EventKind::EmailVerified => "your email address has been verified.".to_string(),
            EventKind::KycSubmitted => {
                "your identity verification documents were submitted.".to_string()
            }
            EventKind::KycVerified => "your identity has been verified.".to_string(),
            EventKind::SuspiciousLogin => format!(
                "a suspicious login was detected from {} ({}). If this was not you, secure your account immediately.",
                vars.get("ip_address").cloned().unwrap_or_default(),
                vars.get("location").cloned().unwrap_or_default()
            ),
            EventKind::PasswordChanged => {
                "your account password was changed. If this was not you, contact support.".to_string()
            }
            EventKind::TwoFaEnabled => {
                "two-factor authentication was enabled on your account.".to_string()
            }
            EventKind::BalanceUpdated => format!(
                "your {} balance changed to {}.",
                vars.get("symbol").cloned().unwrap_or_default(),
                vars.get("balance").cloned().unwrap_or_default()
            ),
            EventKind::PositionClosed => format!(
                "your {} position closed with P&L {}.",
                vars.get("symbol").cloned().unwrap_or_default(),
                vars.get("pnl").cloned().unwrap_or_default()
            ),
            EventKind::PerformanceAlert => format!(
                "your portfolio changed {}% over the last {}.",
                vars.get("change_percent").cloned().unwrap_or_default(),
                vars.get("period").cloned().unwrap_or_default()
            ),
        };

        format!("{}\n\n{}", greeting, detail)
    }
}

/// Builds dispatch requests from decoded events: templated when the mapped
/// template exists and is active, otherwise the fallback formatter.
pub struct EventRouter {
    templates: Arc<TemplateStore>,
    mapping: HashMap<String, String>,
}

impl EventRouter {
    pub fn new(templates: Arc<TemplateStore>) -> Self {
        let mut mapping = HashMap::new();
        for kind in EventKind::all() {
            if let Some(name) = kind.template_name() {
                mapping.insert(kind.as_str().to_string(), name.to_string());
            }
        }
        Self { templates, mapping }
    }

    /// Operator-extended mapping; later entries override the built-ins.
    pub fn with_mapping(mut self, overrides: HashMap<String, String>) -> Self {
        self.mapping.extend(overrides);
        self
    }

    pub async fn build_request(
        &self,
        event: &UpstreamEvent,
        correlation_id: String,
    ) -> DispatchRequest {
        let kind = event.kind();
        let mut request = DispatchRequest::new(Channel::Email, event.user_email())
            .with_email_address(event.user_email())
            .with_category(kind.category())
            .with_priority(kind.priority())
            .with_max_retry_attempts(kind.priority().retry_budget())
            .with_correlation_id(correlation_id)
            .with_reference(kind.as_str(), "EVENT");

        let active_template = match self.mapping.get(kind.as_str()) {
            Some(name) => self.templates.get_by_name(name).await.map(|_| name.clone()),
            None => None,
        };

        match active_template {
            Some(name) => {
                request = request.with_template(name, event.template_variables());
            }
            None => {
                request = request
                    .with_subject(event.fallback_subject())
                    .with_content(event.fallback_content());
            }
        }
        request
    }
}
