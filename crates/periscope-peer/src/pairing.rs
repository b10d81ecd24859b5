use periscope_proto::Role;

/// What the local side does about a newly seen remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiative {
    /// Create the instance and send an offer.
    Offer,
    /// Create the instance and wait for the remote's offer.
    AwaitOffer,
    /// Same role on both ends; never negotiate.
    None,
}

/// The host always originates the offer.
pub fn initiative(local: Role, remote: Role) -> Initiative {
    match (local, remote) {
        (Role::Host, Role::Client) => Initiative::Offer,
        (Role::Client, Role::Host) => Initiative::AwaitOffer,
        _ => Initiative::None,
    }
}

/// Whether an unsolicited offer from `remote` may open a new instance.
pub fn accepts_offer_from(local: Role, remote: Role) -> bool {
    initiative(local, remote) == Initiative::AwaitOffer
}
