//! Natural-language query generation for a school district's student
//! information system.
//!
//! Two generation modes share one safety pipeline:
//! * fragment mode composes SQL from a curated fragment library
//!   ([`composer`]) chosen by the model ([`interpretation`]);
//! * view mode lets the model write SQL over whitelisted `llm_` views,
//!   which is cleaned and validated ([`view_builder`], [`validator`]).
//!
//! Either way the caller's school scope is injected into the final SQL by
//! the [`orchestrator`].

pub mod composer;
pub mod config;
pub mod error;
pub mod executor;
pub mod fragments;
pub mod interpretation;
pub mod llm;
pub mod orchestrator;
pub mod prompts;
pub mod scope;
pub mod sql_text;
pub mod validator;
pub mod view_builder;
pub mod views;

pub use composer::{CompositionResult, FragmentComposer};
pub use config::AppConfig;
pub use error::{QueryError, Result};
pub use fragments::{Fragment, FragmentLibrary, FragmentStore, FragmentType};
pub use interpretation::{parse_interpretation, AIInterpretation};
pub use llm::{ChatMessage, ChatModel, OpenAiChatModel};
pub use orchestrator::{GenerationMode, GenerationRequest, GenerationResponse, QueryGenerator};
pub use scope::AccessScope;
pub use validator::{ValidationResult, ViewSqlValidator};
