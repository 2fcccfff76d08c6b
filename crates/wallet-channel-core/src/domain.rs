use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ports::{BridgeError, HostPort};

pub const ANY_ORIGIN: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Opener,
    Peer,
}

impl Role {
    /// A context that was opened by another window talks back to it; anything else opens.
    pub fn detect<H: HostPort + ?Sized>(host: &H) -> Self {
        if host.opener().is_some() {
            Self::Peer
        } else {
            Self::Opener
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpectedOrigin {
    Any,
    Exact(String),
}

impl ExpectedOrigin {
    pub fn accepts(&self, origin: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(expected) => expected == origin,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::Any)
    }

    pub fn as_target(&self) -> &str {
        match self {
            Self::Any => ANY_ORIGIN,
            Self::Exact(origin) => origin,
        }
    }
}

impl fmt::Display for ExpectedOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_target())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenGeometry {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

impl Default for ScreenGeometry {
    fn default() -> Self {
        Self {
            left: 0,
            top: 0,
            width: 1280,
            height: 800,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowFeatures {
    pub width: u32,
    pub height: u32,
    pub left: i32,
    pub top: i32,
}

impl WindowFeatures {
    pub fn centered(screen: ScreenGeometry, width: u32, height: u32) -> Self {
        let offset = |outer: u32, inner: u32| -> i32 {
            let free = i64::from(outer) - i64::from(inner);
            i32::try_from(free.max(0) / 2).unwrap_or(0)
        };
        Self {
            width,
            height,
            left: screen.left.saturating_add(offset(screen.width, width)),
            top: screen.top.saturating_add(offset(screen.height, height)),
        }
    }
}

impl fmt::Display for WindowFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "width={},height={},left={},top={},scrollbars=yes,resizable=yes",
            self.width, self.height, self.left, self.top
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorDefaults {
    pub width: u32,
    pub height: u32,
    pub handshake_timeout: Duration,
    pub close_poll_interval: Duration,
    pub request_timeout: Duration,
}

impl Default for DescriptorDefaults {
    fn default() -> Self {
        Self {
            width: 400,
            height: 600,
            handshake_timeout: Duration::from_secs(30),
            close_poll_interval: Duration::from_millis(500),
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// Everything needed to reach one peer. Immutable once a transport holds it.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerDescriptor {
    url: String,
    target: String,
    width: u32,
    height: u32,
    origin: ExpectedOrigin,
    handshake_timeout: Duration,
    close_poll_interval: Duration,
    role: Role,
    warnings: Vec<String>,
}

impl PeerDescriptor {
    pub fn new(url: impl Into<String>, role: Role) -> Self {
        Self::with_defaults(url, role, &DescriptorDefaults::default())
    }

    pub fn with_defaults(
        url: impl Into<String>,
        role: Role,
        defaults: &DescriptorDefaults,
    ) -> Self {
        let url = url.into();
        let mut warnings = Vec::new();
        let origin = match parse_origin(&url) {
            Some(origin) => ExpectedOrigin::Exact(origin),
            None => {
                let warning =
                    format!("peer url {url:?} has no parseable origin; accepting any origin");
                tracing::warn!("{warning}");
                warnings.push(warning);
                ExpectedOrigin::Any
            }
        };
        Self {
            url,
            target: "wallet-channel".to_owned(),
            width: defaults.width,
            height: defaults.height,
            origin,
            handshake_timeout: defaults.handshake_timeout,
            close_poll_interval: defaults.close_poll_interval,
            role,
            warnings,
        }
    }

    pub fn from_transport_record(
        record: &TransportRecord,
        role: Role,
        defaults: &DescriptorDefaults,
    ) -> Result<Self, BridgeError> {
        match record.kind {
            TransportKind::Popup => {}
            other => {
                return Err(BridgeError::Configuration(format!(
                    "unsupported transport kind: {other}"
                )))
            }
        }
        let url = record
            .url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| {
                BridgeError::Configuration("popup transport requires a url".to_owned())
            })?;

        let mut descriptor = Self::with_defaults(url, role, defaults);
        if let (Some(width), Some(height)) = (record.width, record.height) {
            descriptor = descriptor.with_size(width, height);
        }
        if let Some(ms) = record.handshake_timeout_ms {
            descriptor = descriptor.with_handshake_timeout(Duration::from_millis(ms));
        }
        Ok(descriptor)
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_close_poll_interval(mut self, interval: Duration) -> Self {
        self.close_poll_interval = interval;
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn origin(&self) -> &ExpectedOrigin {
        &self.origin
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    pub fn close_poll_interval(&self) -> Duration {
        self.close_poll_interval
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

fn parse_origin(raw: &str) -> Option<String> {
    let parsed = url::Url::parse(raw).ok()?;
    let origin = parsed.origin();
    origin.is_tuple().then(|| origin.ascii_serialization())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainFamily {
    Evm,
    Starknet,
    Aleo,
}

impl ChainFamily {
    pub const ALL: [Self; 3] = [Self::Evm, Self::Starknet, Self::Aleo];

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "evm" | "eip155" | "ethereum" => Some(Self::Evm),
            "starknet" => Some(Self::Starknet),
            "aleo" => Some(Self::Aleo),
            _ => None,
        }
    }

    pub fn prefix(self) -> &'static str {
        match self {
            Self::Evm => "eip155",
            Self::Starknet => "starknet",
            Self::Aleo => "aleo",
        }
    }

    /// Production network used when discovery metadata names none.
    pub fn default_network(self) -> &'static str {
        match self {
            Self::Evm => "1",
            Self::Starknet => "SN_MAIN",
            Self::Aleo => "mainnet",
        }
    }

    pub fn sandbox_networks(self) -> &'static [&'static str] {
        match self {
            Self::Evm => &["11155111", "17000", "84532"],
            Self::Starknet => &["SN_SEPOLIA"],
            Self::Aleo => &["testnet", "canary"],
        }
    }

    pub fn base_features(self) -> [Feature; 2] {
        [Feature::MultiAccount, Feature::SignMessage]
    }

    pub fn extra_features(self) -> &'static [Feature] {
        match self {
            Self::Evm => &[
                Feature::SignTypedData,
                Feature::SendTransaction,
                Feature::SwitchChain,
            ],
            Self::Starknet => &[
                Feature::SignTypedData,
                Feature::SendTransaction,
                Feature::DeployContract,
            ],
            Self::Aleo => &[Feature::Encrypt, Feature::Decrypt, Feature::SendTransaction],
        }
    }
}

impl fmt::Display for ChainFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Evm => "evm",
            Self::Starknet => "starknet",
            Self::Aleo => "aleo",
        })
    }
}

/// Fully-qualified network id, rendered as `prefix:reference`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainId {
    family: ChainFamily,
    reference: String,
}

impl ChainId {
    /// Qualifies a possibly bare network id with the family prefix.
    pub fn qualify(family: ChainFamily, raw: &str) -> Result<Self, BridgeError> {
        let raw = raw.trim();
        let reference = match raw.split_once(':') {
            Some((prefix, rest)) => {
                if ChainFamily::parse(prefix) != Some(family) {
                    return Err(BridgeError::Configuration(format!(
                        "network {raw} does not belong to chain family {family}"
                    )));
                }
                rest
            }
            None => raw,
        };
        if reference.is_empty() {
            return Err(BridgeError::Configuration(format!(
                "empty network id for chain family {family}"
            )));
        }
        let reference = match family {
            ChainFamily::Evm => normalize_evm_reference(reference)?,
            _ => reference.to_owned(),
        };
        Ok(Self { family, reference })
    }

    pub fn evm(chain_id: u64) -> Self {
        Self {
            family: ChainFamily::Evm,
            reference: chain_id.to_string(),
        }
    }

    pub fn family(&self) -> ChainFamily {
        self.family
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn is_sandbox(&self) -> bool {
        self.family.sandbox_networks().contains(&self.reference.as_str())
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.family.prefix(), self.reference)
    }
}

/// Accepts `0x`-prefixed hex or plain decimal.
pub fn parse_evm_chain_id(raw: &str) -> Result<u64, std::num::ParseIntError> {
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse(),
    }
}

fn normalize_evm_reference(reference: &str) -> Result<String, BridgeError> {
    parse_evm_chain_id(reference)
        .map(|n| n.to_string())
        .map_err(|e| BridgeError::Configuration(format!("invalid evm chain id {reference}: {e}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Feature {
    MultiAccount,
    SignMessage,
    SignTypedData,
    SendTransaction,
    SwitchChain,
    DeployContract,
    Encrypt,
    Decrypt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkSource {
    Explicit,
    Implied,
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedChain {
    pub family: ChainFamily,
    pub chain_id: ChainId,
    pub interfaces: Vec<String>,
    pub source: NetworkSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NegotiatedCapabilities {
    pub chains: Vec<NegotiatedChain>,
    pub features: BTreeSet<Feature>,
}

impl NegotiatedCapabilities {
    pub fn families(&self) -> Vec<ChainFamily> {
        let mut out = Vec::new();
        for chain in &self.chains {
            if !out.contains(&chain.family) {
                out.push(chain.family);
            }
        }
        out
    }

    pub fn chain_for(&self, family: ChainFamily) -> Option<&NegotiatedChain> {
        self.chains.iter().find(|c| c.family == family)
    }

    pub fn supports(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Popup,
    Extension,
    Injected,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Popup => "popup",
            Self::Extension => "extension",
            Self::Injected => "injected",
            Self::Unknown => "unknown",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportRecord {
    pub kind: TransportKind,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub extension_id: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub handshake_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TechnologyRecord {
    #[serde(rename = "type")]
    pub family: String,
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default, alias = "chainId")]
    pub network: Option<String>,
}

/// What a discovered wallet advertises about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub rdns: Option<String>,
    #[serde(default)]
    pub transport: Option<TransportRecord>,
    #[serde(default)]
    pub technologies: Vec<TechnologyRecord>,
}

impl DiscoveryRecord {
    pub fn from_json(value: &Value) -> Result<Self, BridgeError> {
        let record: Self = serde_json::from_value(value.clone())
            .map_err(|e| BridgeError::Configuration(format!("invalid discovery record: {e}")))?;
        record.validate()?;
        Ok(record)
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.id.trim().is_empty() {
            return Err(BridgeError::Configuration(
                "discovery record id must not be empty".to_owned(),
            ));
        }
        if self.name.trim().is_empty() {
            return Err(BridgeError::Configuration(format!(
                "discovery record {} has no name",
                self.id
            )));
        }
        if self.technologies.is_empty() {
            return Err(BridgeError::Configuration(format!(
                "discovery record {} declares no technologies",
                self.id
            )));
        }
        for tech in &self.technologies {
            if ChainFamily::parse(&tech.family).is_none() {
                return Err(BridgeError::Configuration(format!(
                    "discovery record {} declares unknown chain family {:?}",
                    self.id, tech.family
                )));
            }
        }
        Ok(())
    }

    pub fn metadata(&self) -> WalletMetadata {
        WalletMetadata {
            id: self.id.clone(),
            name: self.name.clone(),
            icon: self.icon.clone(),
            rdns: self.rdns.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletMetadata {
    pub id: String,
    pub name: String,
    pub icon: Option<String>,
    pub rdns: Option<String>,
}
