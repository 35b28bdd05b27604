use crate::error::InvalidTransition;
use serde::{Deserialize, Serialize};

/// Кто создал комнату, а кто к ней подключился
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Transferring,
    Completed,
    Error,
}

/// Типизированные события, двигающие сессию
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    HandshakeStarted,
    ChannelOpened,
    FileStarted,
    FileFinished,
    FileAborted,
    BatchFinished,
    ChannelClosed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SessionState,
    pub to: SessionState,
}

/// Состояние одной пиринговой сессии. Создаётся при старте отправки
/// или подключении, уничтожается при сбросе.
#[derive(Debug, Clone)]
pub struct Session {
    role: Role,
    room_code: String,
    state: SessionState,
    history: Vec<SessionState>,
}

impl Session {
    pub fn new(role: Role, room_code: impl Into<String>) -> Self {
        Self {
            role,
            room_code: room_code.into(),
            state: SessionState::Idle,
            history: vec![SessionState::Idle],
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn room_code(&self) -> &str {
        &self.room_code
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Все состояния, через которые прошла сессия, включая начальное
    pub fn history(&self) -> &[SessionState] {
        &self.history
    }

    /// Применяет событие. `Ok(None)` - событие допустимо, но состояние не меняется.
    pub fn handle(&mut self, event: SessionEvent) -> Result<Option<Transition>, InvalidTransition> {
        use SessionEvent as E;
        use SessionState as S;

        let next = match (self.state, event) {
            // error - терминальное состояние, дальнейшие события игнорируем
            (S::Error, _) => return Ok(None),
            (_, E::ChannelClosed) | (_, E::Failed) => S::Error,

            (S::Idle, E::HandshakeStarted) => S::Connecting,
            (S::Connecting, E::ChannelOpened) => S::Connected,

            (S::Connected, E::FileStarted) | (S::Completed, E::FileStarted) => S::Transferring,
            (S::Transferring, E::FileFinished) | (S::Transferring, E::FileAborted) => S::Connected,
            (S::Connected, E::FileAborted) => return Ok(None),
            (S::Connected, E::BatchFinished) => S::Completed,

            (from, event) => return Err(InvalidTransition { from, event }),
        };

        let transition = Transition {
            from: self.state,
            to: next,
        };
        self.state = next;
        self.history.push(next);
        Ok(Some(transition))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(session: &mut Session, events: &[SessionEvent]) {
        for event in events {
            session.handle(*event).expect("valid transition");
        }
    }

    #[test]
    fn receiver_single_file_sequence() {
        let mut session = Session::new(Role::Responder, "AB12CD");
        drive(
            &mut session,
            &[
                SessionEvent::HandshakeStarted,
                SessionEvent::ChannelOpened,
                SessionEvent::FileStarted,
                SessionEvent::FileFinished,
            ],
        );
        assert_eq!(
            session.history(),
            &[
                SessionState::Idle,
                SessionState::Connecting,
                SessionState::Connected,
                SessionState::Transferring,
                SessionState::Connected,
            ]
        );
    }

    #[test]
    fn sender_batch_completes_and_can_continue() {
        let mut session = Session::new(Role::Initiator, "ZZ99AA");
        drive(
            &mut session,
            &[
                SessionEvent::HandshakeStarted,
                SessionEvent::ChannelOpened,
                SessionEvent::FileStarted,
                SessionEvent::FileFinished,
                SessionEvent::BatchFinished,
            ],
        );
        assert_eq!(session.state(), SessionState::Completed);

        session.handle(SessionEvent::FileStarted).unwrap();
        assert_eq!(session.state(), SessionState::Transferring);
    }

    #[test]
    fn any_state_fails_to_error_and_stays_there() {
        let mut session = Session::new(Role::Initiator, "ZZ99AA");
        drive(&mut session, &[SessionEvent::HandshakeStarted]);
        let t = session.handle(SessionEvent::Failed).unwrap().unwrap();
        assert_eq!(t.from, SessionState::Connecting);
        assert_eq!(t.to, SessionState::Error);

        assert_eq!(session.handle(SessionEvent::ChannelOpened), Ok(None));
        assert_eq!(session.state(), SessionState::Error);
    }

    #[test]
    fn rejects_skipping_the_handshake() {
        let mut session = Session::new(Role::Responder, "AB12CD");
        let err = session.handle(SessionEvent::FileStarted).unwrap_err();
        assert_eq!(err.from, SessionState::Idle);
        assert_eq!(err.event, SessionEvent::FileStarted);
    }
}
