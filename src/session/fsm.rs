use std::fmt;

use log::debug;

/// BGP per-peer session states [RFC 4271 8.2.2]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FsmState {
    Idle,
    Connect,
    Active,
    OpenSent,
    OpenConfirm,
    Established,
}

impl fmt::Display for FsmState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let word = match self {
            FsmState::Idle => "Idle",
            FsmState::Connect => "Connect",
            FsmState::Active => "Active",
            FsmState::OpenSent => "OpenSent",
            FsmState::OpenConfirm => "OpenConfirm",
            FsmState::Established => "Established",
        };
        write!(f, "{}", word)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FsmEvent {
    ManualStart,
    ManualStop,
    TcpConnectionConfirmed,
    TcpConnectionFails,
    BgpOpen,
    BgpOpenMsgErr,
    BgpHeaderErr,
    KeepaliveMsg,
    UpdateMsg,
    UpdateMsgErr,
    NotifMsg,
    HoldTimerExpires,
    KeepaliveTimerExpires,
    ConnectRetryTimerExpires,
}

/// Side effects the session layer must carry out for a transition
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum FsmAction {
    StartConnectRetryTimer,
    StopConnectRetryTimer,
    InitiateTcpConnection,
    SendOpen,
    /// Hold timer at the large pre-negotiation default (240s)
    StartHoldTimerLarge,
    /// Hold timer (re)armed with the negotiated value; never merely stopped
    RestartHoldTimer,
    StartKeepaliveTimer,
    RestartKeepaliveTimer,
    StopTimers,
    SendKeepalive,
    /// Notify with (error code, subcode); data filled by the session
    SendNotification(u8, u8),
    CloseTcp,
    PurgeAdjRibIn,
    /// Walk the Loc-RIB and emit the initial advertisement pass
    RunInitialAdvertisements,
}

/// Pre-negotiation hold time [RFC 4271 8.2.2, Connect state]
pub const LARGE_HOLD_TIMER: u16 = 240;

/// NOTIFICATION codes used by transitions (subset of bgp::notification)
const CODE_UPDATE: u8 = 3;
const CODE_HOLD_TIMER_EXPIRED: u8 = 4;
const CODE_FSM: u8 = 5;
const CODE_CEASE: u8 = 6;

#[derive(Debug)]
pub struct Fsm {
    pub state: FsmState,
}

impl Fsm {
    pub fn new() -> Self {
        Self {
            state: FsmState::Idle,
        }
    }

    /// Minor code for an FSM error NOTIFICATION, by the state the
    /// unexpected message arrived in
    fn fsm_error_subcode(&self) -> u8 {
        match self.state {
            FsmState::OpenSent => 1,
            FsmState::OpenConfirm => 2,
            FsmState::Established => 3,
            _ => 0,
        }
    }

    /// Drive one event through the machine, returning the actions to run
    pub fn handle(&mut self, event: FsmEvent) -> Vec<FsmAction> {
        use FsmAction::*;
        use FsmEvent::*;
        use FsmState::*;

        let (next, actions): (FsmState, Vec<FsmAction>) = match (self.state, event) {
            (Idle, ManualStart) => (
                Connect,
                vec![StartConnectRetryTimer, InitiateTcpConnection],
            ),
            (Idle, _) => (Idle, vec![]),

            (Connect | Active, TcpConnectionConfirmed) => (
                OpenSent,
                vec![StopConnectRetryTimer, SendOpen, StartHoldTimerLarge],
            ),
            (Connect, TcpConnectionFails) => (Active, vec![StartConnectRetryTimer]),
            (Active, TcpConnectionFails) => (Active, vec![StartConnectRetryTimer]),
            (Connect | Active, ConnectRetryTimerExpires) => (
                Connect,
                vec![StartConnectRetryTimer, InitiateTcpConnection],
            ),

            (OpenSent, BgpOpen) => (
                OpenConfirm,
                // Restarted with the negotiated time, NOT stopped: a peer
                // that never sends another byte must still expire
                vec![RestartHoldTimer, SendKeepalive, StartKeepaliveTimer],
            ),
            (OpenSent, TcpConnectionFails) => (Active, vec![CloseTcp, StartConnectRetryTimer]),

            (OpenConfirm, KeepaliveMsg) => (
                Established,
                vec![RestartHoldTimer, RunInitialAdvertisements],
            ),

            (Established, KeepaliveMsg | UpdateMsg) => (Established, vec![RestartHoldTimer]),
            (Established | OpenConfirm, KeepaliveTimerExpires) => {
                // Exactly one KEEPALIVE per expiry
                (self.state, vec![SendKeepalive, RestartKeepaliveTimer])
            }
            (OpenSent, KeepaliveTimerExpires) => (OpenSent, vec![]),

            (_, HoldTimerExpires) => (
                Idle,
                vec![
                    SendNotification(CODE_HOLD_TIMER_EXPIRED, 0),
                    CloseTcp,
                    PurgeAdjRibIn,
                    StopTimers,
                ],
            ),
            (_, NotifMsg) => (Idle, vec![CloseTcp, PurgeAdjRibIn, StopTimers]),
            (_, ManualStop) => (
                Idle,
                vec![
                    SendNotification(CODE_CEASE, 2),
                    CloseTcp,
                    PurgeAdjRibIn,
                    StopTimers,
                ],
            ),
            (_, BgpHeaderErr | BgpOpenMsgErr | UpdateMsgErr) => (
                // Session layer fills in the specific code/subcode
                Idle,
                vec![
                    SendNotification(CODE_UPDATE, 0),
                    CloseTcp,
                    PurgeAdjRibIn,
                    StopTimers,
                ],
            ),
            (Established | OpenConfirm, TcpConnectionFails) => {
                (Idle, vec![CloseTcp, PurgeAdjRibIn, StopTimers])
            }

            // A message valid only in another state is an FSM error
            (OpenSent | OpenConfirm | Established, BgpOpen | KeepaliveMsg | UpdateMsg) => (
                Idle,
                vec![
                    SendNotification(CODE_FSM, self.fsm_error_subcode()),
                    CloseTcp,
                    PurgeAdjRibIn,
                    StopTimers,
                ],
            ),
            (Connect | Active, BgpOpen | KeepaliveMsg | UpdateMsg) => (
                Idle,
                vec![SendNotification(CODE_FSM, 0), CloseTcp, StopTimers],
            ),

            (state, _) => (state, vec![]),
        };

        if next != self.state {
            debug!("FSM {} -> {} on {:?}", self.state, next, event);
            self.state = next;
        }
        actions
    }
}

impl Default for Fsm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fsm_in(state: FsmState) -> Fsm {
        Fsm { state }
    }

    #[test]
    fn test_manual_start_initiates_connection() {
        let mut fsm = Fsm::new();
        let actions = fsm.handle(FsmEvent::ManualStart);
        assert_eq!(fsm.state, FsmState::Connect);
        assert!(actions.contains(&FsmAction::StartConnectRetryTimer));
        assert!(actions.contains(&FsmAction::InitiateTcpConnection));
    }

    #[test]
    fn test_connection_confirmed_sends_open() {
        let mut fsm = fsm_in(FsmState::Connect);
        let actions = fsm.handle(FsmEvent::TcpConnectionConfirmed);
        assert_eq!(fsm.state, FsmState::OpenSent);
        assert_eq!(
            actions,
            vec![
                FsmAction::StopConnectRetryTimer,
                FsmAction::SendOpen,
                FsmAction::StartHoldTimerLarge,
            ]
        );
    }

    #[test]
    fn test_open_restarts_hold_timer_not_stops() {
        let mut fsm = fsm_in(FsmState::OpenSent);
        let actions = fsm.handle(FsmEvent::BgpOpen);
        assert_eq!(fsm.state, FsmState::OpenConfirm);
        // The Hold timer must be restarted with the negotiated value
        assert!(actions.contains(&FsmAction::RestartHoldTimer));
        assert!(!actions.contains(&FsmAction::StopTimers));
        assert!(actions.contains(&FsmAction::SendKeepalive));
        assert!(actions.contains(&FsmAction::StartKeepaliveTimer));
    }

    #[test]
    fn test_keepalive_confirms_session() {
        let mut fsm = fsm_in(FsmState::OpenConfirm);
        let actions = fsm.handle(FsmEvent::KeepaliveMsg);
        assert_eq!(fsm.state, FsmState::Established);
        assert!(actions.contains(&FsmAction::RestartHoldTimer));
        assert!(actions.contains(&FsmAction::RunInitialAdvertisements));
        // No KEEPALIVE is emitted on the transition itself
        assert!(!actions.contains(&FsmAction::SendKeepalive));
    }

    #[test]
    fn test_keepalive_timer_sends_exactly_one() {
        let mut fsm = fsm_in(FsmState::Established);
        let actions = fsm.handle(FsmEvent::KeepaliveTimerExpires);
        assert_eq!(fsm.state, FsmState::Established);
        let sends = actions
            .iter()
            .filter(|action| **action == FsmAction::SendKeepalive)
            .count();
        assert_eq!(sends, 1);
        assert!(actions.contains(&FsmAction::RestartKeepaliveTimer));
    }

    #[test]
    fn test_hold_expiry_tears_down_and_purges() {
        for state in [
            FsmState::Connect,
            FsmState::OpenSent,
            FsmState::OpenConfirm,
            FsmState::Established,
        ] {
            let mut fsm = fsm_in(state);
            let actions = fsm.handle(FsmEvent::HoldTimerExpires);
            assert_eq!(fsm.state, FsmState::Idle);
            assert!(actions.contains(&FsmAction::SendNotification(4, 0)));
            assert!(actions.contains(&FsmAction::CloseTcp));
            assert!(actions.contains(&FsmAction::PurgeAdjRibIn));
        }
    }

    #[test]
    fn test_notification_tears_down_quietly() {
        let mut fsm = fsm_in(FsmState::Established);
        let actions = fsm.handle(FsmEvent::NotifMsg);
        assert_eq!(fsm.state, FsmState::Idle);
        assert!(actions.contains(&FsmAction::PurgeAdjRibIn));
        assert!(!actions
            .iter()
            .any(|action| matches!(action, FsmAction::SendNotification(..))));
    }

    #[test]
    fn test_connect_fails_backs_off_to_active() {
        let mut fsm = fsm_in(FsmState::Connect);
        let actions = fsm.handle(FsmEvent::TcpConnectionFails);
        assert_eq!(fsm.state, FsmState::Active);
        assert!(actions.contains(&FsmAction::StartConnectRetryTimer));

        let actions = fsm.handle(FsmEvent::ConnectRetryTimerExpires);
        assert_eq!(fsm.state, FsmState::Connect);
        assert!(actions.contains(&FsmAction::InitiateTcpConnection));
    }

    #[test]
    fn test_open_in_established_is_fsm_error() {
        let mut fsm = fsm_in(FsmState::Established);
        let actions = fsm.handle(FsmEvent::BgpOpen);
        assert_eq!(fsm.state, FsmState::Idle);
        assert!(actions.contains(&FsmAction::SendNotification(5, 3)));
    }

    #[test]
    fn test_events_ignored_in_idle() {
        let mut fsm = Fsm::new();
        assert!(fsm.handle(FsmEvent::KeepaliveMsg).is_empty());
        assert!(fsm.handle(FsmEvent::HoldTimerExpires).is_empty());
        assert_eq!(fsm.state, FsmState::Idle);
    }
}
