//! Destination resolution.
//!
//! A [`DestinationRef`] is resolved once; the outcome (success or failure) is
//! cached for the lifetime of the owning endpoint.

use crate::domain::destination::{Domain, Lifetime, ResolvedDestination};
use crate::domain::error::ResolutionError;
use crate::ports::outbound::ResolveDestination;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// How an endpoint names its destination.
#[derive(Clone)]
pub enum DestinationRef {
    /// A name interpreted by the transport in the endpoint's domain.
    Named(String),
    /// An already resolved destination, used as-is.
    Explicit(ResolvedDestination),
    /// A name handed to a resolver callback.
    Resolved {
        name: String,
        resolver: Arc<dyn ResolveDestination>,
    },
}

impl fmt::Debug for DestinationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(name) => f.debug_tuple("Named").field(name).finish(),
            Self::Explicit(destination) => f.debug_tuple("Explicit").field(destination).finish(),
            Self::Resolved { name, .. } => f
                .debug_struct("Resolved")
                .field("name", name)
                .finish_non_exhaustive(),
        }
    }
}

/// Resolves a [`DestinationRef`] at most once.
pub struct DestinationResolver {
    reference: DestinationRef,
    pub_sub_domain: bool,
    cached: OnceLock<Result<ResolvedDestination, ResolutionError>>,
}

impl DestinationResolver {
    pub fn new(reference: DestinationRef, pub_sub_domain: bool) -> Self {
        Self {
            reference,
            pub_sub_domain,
            cached: OnceLock::new(),
        }
    }

    pub fn reference(&self) -> &DestinationRef {
        &self.reference
    }

    /// Resolve, invoking a resolver callback on the first call only.
    pub fn resolve(&self) -> Result<ResolvedDestination, ResolutionError> {
        self.cached.get_or_init(|| self.resolve_uncached()).clone()
    }

    /// Whether resolution already happened.
    pub fn is_resolved(&self) -> bool {
        self.cached.get().is_some()
    }

    fn resolve_uncached(&self) -> Result<ResolvedDestination, ResolutionError> {
        let result = match &self.reference {
            DestinationRef::Named(name) => {
                if name.trim().is_empty() {
                    return Err(ResolutionError::UnknownDestination(name.clone()));
                }
                Ok(ResolvedDestination {
                    name: name.clone(),
                    domain: Domain::from_pub_sub(self.pub_sub_domain),
                    lifetime: Lifetime::Durable,
                })
            }
            DestinationRef::Explicit(destination) => Ok(destination.clone()),
            DestinationRef::Resolved { name, resolver } => {
                resolver.resolve(name, self.pub_sub_domain)
            }
        };

        match &result {
            Ok(destination) => debug!(destination = %destination, "Destination resolved"),
            Err(e) => warn!(reference = ?self.reference, error = %e, "Destination resolution failed"),
        }
        result
    }
}
