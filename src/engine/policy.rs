use ulid::Ulid;

use crate::model::{Actor, Role, ScheduleStatus};

use super::EngineError;

/// How the caller relates to the schedule under examination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// The caller owns the slot the schedule points at.
    SlotOwner,
    /// The caller is the customer who booked the schedule.
    BookingCustomer,
}

use Relation::*;
use Role::*;
use ScheduleStatus::*;

/// The authorization table for status transitions: which role, standing
/// in which relation to the schedule, may drive which edge. Everything
/// the state machine permits is a row here; there is no other place
/// transition rights are decided.
const TRANSITIONS: &[(Role, Relation, ScheduleStatus, ScheduleStatus)] = &[
    (Customer, BookingCustomer, Scheduled, Cancelled),
    (Owner, SlotOwner, Scheduled, InProgress),
    (Owner, SlotOwner, Scheduled, Completed),
    (Owner, SlotOwner, Scheduled, Cancelled),
    (Owner, SlotOwner, InProgress, Completed),
    (Owner, SlotOwner, InProgress, Cancelled),
];

fn relation(actor: &Actor, owner_id: Ulid, customer_id: Ulid) -> Option<Relation> {
    match actor.role {
        Owner if actor.id == owner_id => Some(SlotOwner),
        Customer if actor.id == customer_id => Some(BookingCustomer),
        _ => None,
    }
}

/// Decide a status transition. Error precedence: a terminal source state
/// is always `InvalidTransition`; an edge nobody may drive is
/// `InvalidTransition`; an edge that exists but not for this caller is
/// `Forbidden`.
pub fn authorize_transition(
    actor: &Actor,
    owner_id: Ulid,
    customer_id: Ulid,
    from: ScheduleStatus,
    to: ScheduleStatus,
) -> Result<(), EngineError> {
    if from.is_terminal() {
        return Err(EngineError::InvalidTransition { from, to });
    }
    if !TRANSITIONS.iter().any(|(_, _, f, t)| *f == from && *t == to) {
        return Err(EngineError::InvalidTransition { from, to });
    }
    match relation(actor, owner_id, customer_id) {
        Some(rel)
            if TRANSITIONS
                .iter()
                .any(|(role, r, f, t)| *role == actor.role && *r == rel && *f == from && *t == to) =>
        {
            Ok(())
        }
        Some(_) => Err(EngineError::Forbidden("not permitted for this caller")),
        None => Err(EngineError::Forbidden("caller is not party to this schedule")),
    }
}

/// Reserving: a customer books for themselves; the slot's owner may book
/// on behalf of any customer (walk-ins).
pub fn authorize_reserve(
    actor: &Actor,
    owner_id: Ulid,
    customer_id: Ulid,
) -> Result<(), EngineError> {
    match actor.role {
        Customer if actor.id == customer_id => Ok(()),
        Customer => Err(EngineError::Forbidden("customers may only book for themselves")),
        Owner if actor.id == owner_id => Ok(()),
        Owner => Err(EngineError::Forbidden("not the owner of this slot")),
    }
}

/// Owner-scoped management commands (templates, slots, materialization,
/// the owner record itself): only the owner acting on their own data.
pub fn require_self_owner(actor: &Actor, owner_id: Ulid) -> Result<(), EngineError> {
    match actor.role {
        Owner if actor.id == owner_id => Ok(()),
        Owner => Err(EngineError::Forbidden("not the owner of this resource")),
        Customer => Err(EngineError::Forbidden("owner role required")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (Ulid, Ulid) {
        (Ulid::new(), Ulid::new())
    }

    #[test]
    fn customer_may_cancel_scheduled_only() {
        let (owner_id, customer_id) = ids();
        let actor = Actor::customer(customer_id);

        assert!(authorize_transition(&actor, owner_id, customer_id, Scheduled, Cancelled).is_ok());
        assert!(matches!(
            authorize_transition(&actor, owner_id, customer_id, InProgress, Cancelled),
            Err(EngineError::Forbidden(_))
        ));
        assert!(matches!(
            authorize_transition(&actor, owner_id, customer_id, Scheduled, InProgress),
            Err(EngineError::Forbidden(_))
        ));
    }

    #[test]
    fn owner_may_drive_all_forward_edges() {
        let (owner_id, customer_id) = ids();
        let actor = Actor::owner(owner_id);

        for (from, to) in [
            (Scheduled, InProgress),
            (Scheduled, Completed),
            (Scheduled, Cancelled),
            (InProgress, Completed),
            (InProgress, Cancelled),
        ] {
            assert!(
                authorize_transition(&actor, owner_id, customer_id, from, to).is_ok(),
                "{} -> {} should be allowed for the owner",
                from.as_str(),
                to.as_str()
            );
        }
    }

    #[test]
    fn terminal_states_reject_everything() {
        let (owner_id, customer_id) = ids();
        let actor = Actor::owner(owner_id);

        for from in [Completed, Cancelled] {
            for to in [Scheduled, InProgress, Completed, Cancelled] {
                assert!(matches!(
                    authorize_transition(&actor, owner_id, customer_id, from, to),
                    Err(EngineError::InvalidTransition { .. })
                ));
            }
        }
    }

    #[test]
    fn nonexistent_edge_is_invalid_not_forbidden() {
        let (owner_id, customer_id) = ids();
        let actor = Actor::owner(owner_id);
        // Going backwards is an edge no role has.
        assert!(matches!(
            authorize_transition(&actor, owner_id, customer_id, InProgress, Scheduled),
            Err(EngineError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn strangers_are_forbidden() {
        let (owner_id, customer_id) = ids();
        let other_owner = Actor::owner(Ulid::new());
        let other_customer = Actor::customer(Ulid::new());

        assert!(matches!(
            authorize_transition(&other_owner, owner_id, customer_id, Scheduled, Cancelled),
            Err(EngineError::Forbidden(_))
        ));
        assert!(matches!(
            authorize_transition(&other_customer, owner_id, customer_id, Scheduled, Cancelled),
            Err(EngineError::Forbidden(_))
        ));
    }

    #[test]
    fn reserve_rules() {
        let (owner_id, customer_id) = ids();

        assert!(authorize_reserve(&Actor::customer(customer_id), owner_id, customer_id).is_ok());
        assert!(authorize_reserve(&Actor::owner(owner_id), owner_id, customer_id).is_ok());
        assert!(matches!(
            authorize_reserve(&Actor::customer(Ulid::new()), owner_id, customer_id),
            Err(EngineError::Forbidden(_))
        ));
        assert!(matches!(
            authorize_reserve(&Actor::owner(Ulid::new()), owner_id, customer_id),
            Err(EngineError::Forbidden(_))
        ));
    }

    #[test]
    fn self_owner_check() {
        let owner_id = Ulid::new();
        assert!(require_self_owner(&Actor::owner(owner_id), owner_id).is_ok());
        assert!(require_self_owner(&Actor::owner(Ulid::new()), owner_id).is_err());
        assert!(require_self_owner(&Actor::customer(owner_id), owner_id).is_err());
    }
}
