mod configuration;
mod member;

pub use configuration::Configuration;
pub use member::Availability;
pub use member::Member;
pub use member::MemberId;
pub use member::MemberKind;
