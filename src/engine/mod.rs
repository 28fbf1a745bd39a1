//! The interception engine.
//!
//! [`Dispatcher`] answers intercepted requests from the active generation's
//! cache regions; [`Coordinator`] installs new generations, promotes them and
//! prunes the regions they leave behind. Both share one [`EngineContext`].

mod classify;
mod context;
mod definition;
mod dispatch;
mod fallback;
mod lifecycle;
mod request;
mod response;

pub use classify::{Matcher, ResourceClass, RouteRule, RouteTable, Strategy};
pub use context::EngineContext;
pub use definition::{
    DefinitionError, DefinitionSource, GenerationDefinition, GenerationProfile, ManifestFile,
    MatchKind, PrecacheEntry, RouteRuleConfig,
};
pub use dispatch::{DeclineReason, Dispatcher, Interception};
pub use fallback::FallbackResolver;
pub use lifecycle::{
    ActivationReport, ClientAttachment, Coordinator, GenerationRegistry, InstallOutcome,
    InstallReport, LifecycleError, LifecycleState,
};
pub use request::{AbortSignal, InterceptedRequest, RequestMode};
pub use response::{EngineResponse, OFFLINE_STATUS, OfflineFlavor, ResponseSource};
