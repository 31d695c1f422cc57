use serde::Serialize;

/// Состояние одного соединения с собеседником
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    New,
    /// view_request отправлен, ждём offer (только у преподавателя)
    Requesting,
    Negotiating,
    Connected,
    Closed,
}

impl LinkState {
    /// Можно ли принять входящий offer
    pub fn accepts_offer(self) -> bool {
        matches!(self, LinkState::New | LinkState::Requesting)
    }

    pub fn is_live(self) -> bool {
        self != LinkState::Closed
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LinkState::New => "new",
            LinkState::Requesting => "requesting",
            LinkState::Negotiating => "negotiating",
            LinkState::Connected => "connected",
            LinkState::Closed => "closed",
        };
        f.write_str(s)
    }
}
