use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Standard,
    Reseller,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Standard => "standard",
            Role::Reseller => "reseller",
            Role::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(Role::Standard),
            "reseller" => Ok(Role::Reseller),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub username: String,
    pub balance: i64,
    pub role: Role,
    pub registered_at: DateTime<Utc>,
}

/// Why a ledger entry exists. Stored as text; closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerReason {
    TopupGateway,
    TopupDonation,
    AdminAdd,
    AdminReduce,
    AdminSet,
    Purchase,
    Renewal,
}

impl LedgerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerReason::TopupGateway => "topup-gateway",
            LedgerReason::TopupDonation => "topup-donation",
            LedgerReason::AdminAdd => "admin-add",
            LedgerReason::AdminReduce => "admin-reduce",
            LedgerReason::AdminSet => "admin-set",
            LedgerReason::Purchase => "purchase",
            LedgerReason::Renewal => "renewal",
        }
    }
}

impl FromStr for LedgerReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "topup-gateway" => Ok(LedgerReason::TopupGateway),
            "topup-donation" => Ok(LedgerReason::TopupDonation),
            "admin-add" => Ok(LedgerReason::AdminAdd),
            "admin-reduce" => Ok(LedgerReason::AdminReduce),
            "admin-set" => Ok(LedgerReason::AdminSet),
            "purchase" => Ok(LedgerReason::Purchase),
            "renewal" => Ok(LedgerReason::Renewal),
            other => Err(format!("unknown ledger reason: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub id: i64,
    pub user_id: String,
    pub amount: i64,
    pub reason: LedgerReason,
    pub correlation_id: Option<String>,
    pub balance_after: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayChannel {
    Gateway,
    Donation,
}

impl PayChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayChannel::Gateway => "gateway",
            PayChannel::Donation => "donation",
        }
    }

    pub fn topup_reason(&self) -> LedgerReason {
        match self {
            PayChannel::Gateway => LedgerReason::TopupGateway,
            PayChannel::Donation => LedgerReason::TopupDonation,
        }
    }
}

impl FromStr for PayChannel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gateway" => Ok(PayChannel::Gateway),
            "donation" => Ok(PayChannel::Donation),
            other => Err(format!("unknown pay channel: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceStatus {
    Pending,
    Paid,
    Expired,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, InvoiceStatus::Pending)
    }
}

impl FromStr for InvoiceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(InvoiceStatus::Pending),
            "paid" => Ok(InvoiceStatus::Paid),
            "expired" => Ok(InvoiceStatus::Expired),
            other => Err(format!("unknown invoice status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoice {
    pub id: String,
    pub user_id: String,
    pub amount: i64,
    pub channel: PayChannel,
    pub status: InvoiceStatus,
    pub created_at: DateTime<Utc>,
}

/// Remote account protocols. Open set on the wire; closed here for dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Ssh,
    Vmess,
    Vless,
    Trojan,
    Shadowsocks,
    Socks5,
    NoobzUdp,
}

impl Protocol {
    pub const ALL: [Protocol; 7] = [
        Protocol::Ssh,
        Protocol::Vmess,
        Protocol::Vless,
        Protocol::Trojan,
        Protocol::Shadowsocks,
        Protocol::Socks5,
        Protocol::NoobzUdp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Ssh => "ssh",
            Protocol::Vmess => "vmess",
            Protocol::Vless => "vless",
            Protocol::Trojan => "trojan",
            Protocol::Shadowsocks => "ss",
            Protocol::Socks5 => "s5",
            Protocol::NoobzUdp => "noobz",
        }
    }

    /// Protocols where the user supplies a password; others get a generated
    /// secret on the panel side.
    pub fn takes_password(&self) -> bool {
        matches!(self, Protocol::Ssh | Protocol::Socks5)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ssh" => Ok(Protocol::Ssh),
            "vmess" => Ok(Protocol::Vmess),
            "vless" => Ok(Protocol::Vless),
            "trojan" => Ok(Protocol::Trojan),
            "ss" => Ok(Protocol::Shadowsocks),
            "s5" => Ok(Protocol::Socks5),
            "noobz" => Ok(Protocol::NoobzUdp),
            other => Err(format!("unknown protocol: {other}")),
        }
    }
}

/// A time-bounded entitlement to a provisioned remote account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub id: i64,
    pub user_id: String,
    pub server_id: String,
    pub protocol: Protocol,
    pub username: String,
    pub price: i64,
    pub trial: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub reminder_sent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRecord {
    pub id: String,
    pub name: String,
    pub endpoint: String,
    pub api_token: String,
    pub created_at: DateTime<Utc>,
}
