pub mod extractor;
pub mod recovery;
pub mod region;
pub mod validator;

pub use extractor::{CandidateExtractor, CandidateKind, PhoneCandidate};
pub use recovery::RecoveryGrammar;
pub use region::Region;
pub use validator::{LibPhoneValidator, ParsedNumber, PhoneMatch, PhoneValidator};
