//! Resolves concrete networks and the feature set a discovered wallet offers.
//!
//! Per family the network comes from, in order: the explicit id in the
//! discovery record, the id implied by its interface list, the family's
//! production default. Repeated families are not merged; each entry yields
//! its own capability row.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::domain::{
    ChainFamily, ChainId, DiscoveryRecord, NegotiatedCapabilities, NegotiatedChain,
    NetworkSource, TechnologyRecord,
};
use crate::ports::BridgeError;

const IMPLIED_NETWORKS: &[(ChainFamily, &str, &str)] = &[
    (ChainFamily::Evm, "base", "8453"),
    (ChainFamily::Evm, "optimism", "10"),
    (ChainFamily::Evm, "arbitrum", "42161"),
    (ChainFamily::Evm, "polygon", "137"),
    (ChainFamily::Starknet, "get-starknet", "SN_MAIN"),
    (ChainFamily::Aleo, "aleo-wallet-adapter", "mainnet"),
];

pub fn implied_network(family: ChainFamily, interfaces: &[String]) -> Option<&'static str> {
    interfaces.iter().find_map(|iface| {
        let iface = iface.trim().to_ascii_lowercase();
        IMPLIED_NETWORKS
            .iter()
            .find(|(f, dialect, _)| *f == family && *dialect == iface)
            .map(|(_, _, network)| *network)
    })
}

pub fn resolve_network(
    family: ChainFamily,
    tech: &TechnologyRecord,
) -> Result<(ChainId, NetworkSource), BridgeError> {
    if let Some(explicit) = tech.network.as_deref().filter(|n| !n.trim().is_empty()) {
        return Ok((ChainId::qualify(family, explicit)?, NetworkSource::Explicit));
    }
    if let Some(implied) = implied_network(family, &tech.interfaces) {
        return Ok((ChainId::qualify(family, implied)?, NetworkSource::Implied));
    }
    Ok((
        ChainId::qualify(family, family.default_network())?,
        NetworkSource::Default,
    ))
}

pub fn negotiate(record: &DiscoveryRecord) -> Result<NegotiatedCapabilities, BridgeError> {
    let mut chains = Vec::with_capacity(record.technologies.len());
    let mut features = BTreeSet::new();

    for tech in &record.technologies {
        let family = ChainFamily::parse(&tech.family).ok_or_else(|| {
            BridgeError::Configuration(format!("unknown chain family {:?}", tech.family))
        })?;
        let (chain_id, source) = resolve_network(family, tech)?;
        tracing::debug!(wallet = %record.id, %chain_id, ?source, "resolved network");

        features.extend(family.base_features());
        features.extend(family.extra_features().iter().copied());
        chains.push(NegotiatedChain {
            family,
            chain_id,
            interfaces: tech.interfaces.clone(),
            source,
        });
    }

    Ok(NegotiatedCapabilities { chains, features })
}

/// Caches negotiation results per discovery record.
#[derive(Debug, Default)]
pub struct Negotiator {
    resolved: HashMap<String, (Vec<TechnologyRecord>, Arc<NegotiatedCapabilities>)>,
}

impl Negotiator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn negotiate(
        &mut self,
        record: &DiscoveryRecord,
    ) -> Result<Arc<NegotiatedCapabilities>, BridgeError> {
        if let Some((techs, caps)) = self.resolved.get(&record.id) {
            if *techs == record.technologies {
                return Ok(Arc::clone(caps));
            }
        }
        let caps = Arc::new(negotiate(record)?);
        self.resolved.insert(
            record.id.clone(),
            (record.technologies.clone(), Arc::clone(&caps)),
        );
        Ok(caps)
    }

    /// Families to connect when the caller asked for none: every negotiated one.
    pub fn default_chains(caps: &NegotiatedCapabilities) -> Vec<ChainFamily> {
        caps.families()
    }
}
