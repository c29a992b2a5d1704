// src/phase.rs
//
// Election phase and the permissions derived from it. Everything here is a
// pure function of ledger data and a timestamp; the ledger stays the
// authority and these flags only drive what a UI offers.

use serde::{Deserialize, Serialize};

use crate::types::{ElectionInfo, Role, Timestamp, UserRole, Voter};

/// Stage of the election lifecycle, in lifecycle order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    Setup,
    Registration,
    Preparation,
    Voting,
    Ended,
    Finalized,
}

impl Phase {
    /// Whether moving from `self` to `next` respects the lifecycle: phases
    /// only move forward, and `Finalized` is reachable only from `Ended`.
    pub fn can_transition_to(self, next: Phase) -> bool {
        match next {
            Phase::Finalized => matches!(self, Phase::Ended | Phase::Finalized),
            _ => next >= self,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Setup => "setup",
            Phase::Registration => "registration",
            Phase::Preparation => "preparation",
            Phase::Voting => "voting",
            Phase::Ended => "ended",
            Phase::Finalized => "finalized",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derive the phase of `info` at `now`. `isFinalized` overrides the clock.
pub fn phase_of(info: Option<&ElectionInfo>, now: Timestamp) -> Phase {
    let Some(info) = info else {
        return Phase::Setup;
    };

    if info.is_finalized {
        Phase::Finalized
    } else if now < info.registration_deadline {
        Phase::Registration
    } else if now < info.start_time {
        Phase::Preparation
    } else if now <= info.end_time {
        Phase::Voting
    } else {
        Phase::Ended
    }
}

/// Seconds until the current phase's time boundary, if it has one.
pub fn time_remaining(info: Option<&ElectionInfo>, now: Timestamp) -> Option<u64> {
    let info = info?;
    match phase_of(Some(info), now) {
        Phase::Registration => Some(info.registration_deadline - now),
        Phase::Preparation => Some(info.start_time - now),
        // Voting includes `end_time` itself.
        Phase::Voting => Some((info.end_time - now).saturating_add(1)),
        Phase::Setup | Phase::Ended | Phase::Finalized => None,
    }
}

/// What the connected account may attempt right now.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub can_register: bool,
    pub can_vote: bool,
    pub can_add_candidate: bool,
    pub can_start_voting: bool,
    pub can_end_voting: bool,
    pub can_finalize: bool,
}

impl Permissions {
    pub fn derive(
        voter: &Voter,
        role: &UserRole,
        phase: Phase,
        info: Option<&ElectionInfo>,
    ) -> Self {
        let role = role.effective();
        let is_commissioner = role == Role::Commissioner;
        let finalized = info.is_some_and(|i| i.is_finalized);

        Self {
            can_register: phase == Phase::Registration && !voter.is_registered,
            can_vote: voter.is_registered && !voter.has_voted && phase == Phase::Voting,
            can_add_candidate: role >= Role::Admin
                && matches!(
                    phase,
                    Phase::Setup | Phase::Registration | Phase::Preparation
                ),
            can_start_voting: is_commissioner && phase == Phase::Preparation,
            can_end_voting: is_commissioner && phase == Phase::Voting,
            can_finalize: is_commissioner && phase == Phase::Ended && !finalized,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T1: u64 = 1_000;
    const T2: u64 = 2_000;
    const T3: u64 = 3_000;

    fn info() -> ElectionInfo {
        ElectionInfo {
            title: "Student council".into(),
            description: String::new(),
            registration_deadline: T1,
            start_time: T2,
            end_time: T3,
            is_active: false,
            is_finalized: false,
            total_voters: 0,
            total_votes: 0,
            winner_id: 0,
        }
    }

    fn voter(registered: bool, voted: bool) -> Voter {
        Voter {
            is_registered: registered,
            has_voted: voted,
            ..Voter::unregistered([1; 20])
        }
    }

    fn role(r: Role) -> UserRole {
        UserRole {
            role: r,
            is_active: true,
            ..UserRole::none([1; 20])
        }
    }

    #[test]
    fn open_ended_voting_does_not_overflow() {
        let open = ElectionInfo {
            registration_deadline: 0,
            start_time: 0,
            end_time: u64::MAX,
            ..info()
        };
        assert_eq!(phase_of(Some(&open), 0), Phase::Voting);
        assert_eq!(time_remaining(Some(&open), 0), Some(u64::MAX));
        assert_eq!(time_remaining(Some(&open), T2), Some(u64::MAX - T2 + 1));
    }

    #[test]
    fn phase_follows_schedule() {
        let i = info();
        assert_eq!(phase_of(None, 0), Phase::Setup);
        assert_eq!(phase_of(Some(&i), 0), Phase::Registration);
        assert_eq!(phase_of(Some(&i), T1 - 1), Phase::Registration);
        assert_eq!(phase_of(Some(&i), T1), Phase::Preparation);
        assert_eq!(phase_of(Some(&i), T2 - 1), Phase::Preparation);
        assert_eq!(phase_of(Some(&i), T2), Phase::Voting);
        assert_eq!(phase_of(Some(&i), T3), Phase::Voting);
        assert_eq!(phase_of(Some(&i), T3 + 1), Phase::Ended);
    }

    #[test]
    fn finalized_overrides_clock() {
        let i = ElectionInfo {
            is_finalized: true,
            ..info()
        };
        for t in [0, T1, T2, T3, T3 + 10] {
            assert_eq!(phase_of(Some(&i), t), Phase::Finalized);
        }
    }

    #[test]
    fn phase_is_monotonic_in_time() {
        let i = info();
        let mut prev = phase_of(Some(&i), 0);
        for t in (0..=T3 + 50).step_by(7) {
            let p = phase_of(Some(&i), t);
            assert!(prev.can_transition_to(p), "{prev} -> {p} at {t}");
            prev = p;
        }
    }

    #[test]
    fn finalized_only_from_ended() {
        assert!(Phase::Ended.can_transition_to(Phase::Finalized));
        assert!(!Phase::Voting.can_transition_to(Phase::Finalized));
        assert!(!Phase::Voting.can_transition_to(Phase::Registration));
        assert!(Phase::Setup.can_transition_to(Phase::Voting));
    }

    #[test]
    fn time_remaining_counts_to_boundary() {
        let i = info();
        assert_eq!(time_remaining(Some(&i), T1 - 10), Some(10));
        assert_eq!(time_remaining(Some(&i), T2 - 1), Some(1));
        assert_eq!(time_remaining(Some(&i), T3), Some(1));
        assert_eq!(time_remaining(Some(&i), T3 + 1), None);
        assert_eq!(time_remaining(None, 0), None);
    }

    #[test]
    fn voter_permissions() {
        let i = info();
        let none = role(Role::None);

        let p = Permissions::derive(&voter(false, false), &none, Phase::Registration, Some(&i));
        assert!(p.can_register);
        assert!(!p.can_vote);

        let p = Permissions::derive(&voter(true, false), &none, Phase::Registration, Some(&i));
        assert!(!p.can_register);

        let p = Permissions::derive(&voter(true, false), &none, Phase::Voting, Some(&i));
        assert!(p.can_vote);

        let p = Permissions::derive(&voter(true, true), &none, Phase::Voting, Some(&i));
        assert!(!p.can_vote);

        let p = Permissions::derive(&voter(false, false), &none, Phase::Voting, Some(&i));
        assert!(!p.can_vote);
    }

    #[test]
    fn admin_and_commissioner_permissions() {
        let i = info();
        let v = voter(false, false);

        let admin = role(Role::Admin);
        assert!(Permissions::derive(&v, &admin, Phase::Setup, None).can_add_candidate);
        assert!(Permissions::derive(&v, &admin, Phase::Preparation, Some(&i)).can_add_candidate);
        assert!(!Permissions::derive(&v, &admin, Phase::Voting, Some(&i)).can_add_candidate);
        assert!(!Permissions::derive(&v, &admin, Phase::Preparation, Some(&i)).can_start_voting);

        let observer = role(Role::Observer);
        assert!(!Permissions::derive(&v, &observer, Phase::Setup, None).can_add_candidate);

        let c = role(Role::Commissioner);
        let prep = Permissions::derive(&v, &c, Phase::Preparation, Some(&i));
        assert!(prep.can_start_voting && prep.can_add_candidate && !prep.can_end_voting);
        assert!(Permissions::derive(&v, &c, Phase::Voting, Some(&i)).can_end_voting);
        assert!(Permissions::derive(&v, &c, Phase::Ended, Some(&i)).can_finalize);

        let done = ElectionInfo {
            is_finalized: true,
            ..info()
        };
        assert!(!Permissions::derive(&v, &c, Phase::Ended, Some(&done)).can_finalize);
        assert!(!Permissions::derive(&v, &c, Phase::Finalized, Some(&done)).can_finalize);
    }

    #[test]
    fn revoked_commissioner_has_no_power() {
        let revoked = UserRole {
            is_active: false,
            ..role(Role::Commissioner)
        };
        let p = Permissions::derive(&voter(false, false), &revoked, Phase::Preparation, None);
        assert_eq!(
            p,
            Permissions {
                can_register: false,
                ..Permissions::default()
            }
        );
    }
}
