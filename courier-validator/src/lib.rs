//! Recipient address validation.
//!
//! Two checks are applied to every recipient before anything is written or
//! sent: a conservative syntactic check ([`validate_format`]) and a live MX
//! lookup ([`AddressValidator::validate_domain`]). Domain validation fails
//! closed: any resolver error is reported as "invalid".

pub mod dns;
pub mod error;
pub mod format;
pub mod shield;
pub mod validator;

pub use dns::{
    DnsConfig, HickoryMxResolver, MxLookup, MxRecord, MxResolver, StaticAnswer, StaticMxResolver,
};
pub use error::DnsError;
pub use format::{domain_of, normalize, validate_format};
pub use shield::SelfSendShield;
pub use validator::{AddressCheck, AddressValidator};
