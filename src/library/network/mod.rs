pub mod link;
pub mod origin;
pub mod socket_helpers;
