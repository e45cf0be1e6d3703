pub mod account;
pub mod event;
pub mod organization;
pub mod session;
pub mod tombstone;

pub use account::{Account, AccountEmail, AccountPassword, Role, UnsupportedRole};
pub use event::{
    EventBox, EventHeaders, EventMessage, EventRecord, EventStatus, Settlement,
};
pub use organization::{OrgMember, Organization};
pub use session::{AccountActor, Page, Session};
pub use tombstone::{EntityType, Tombstone};
