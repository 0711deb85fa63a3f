pub mod config;
pub mod domain;
pub mod errors;
pub mod recommend;

pub use domain::conversation::{ConversationTurn, NewTurn, TurnKind, TurnRole};
pub use domain::item::{CatalogItem, ItemId, ItemStatus, RecommendationCandidate};
pub use domain::persona::{
    OwnedPersona, PersonaDescriptor, PersonaId, PersonaProfile, UserPersonaState,
    DEFAULT_PERSONA_ID,
};
pub use domain::user::{
    DeductOutcome, DrawOutcome, GrantReceipt, UserAccount, UserId, WalletBalance,
};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use recommend::{CandidateRecommender, RecommenderSettings};
