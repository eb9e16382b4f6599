use std::fmt;

/// The state of a sink as reported back on its resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkStatus {
    /// The sink's routing is in effect on every target.
    Ready,

    /// The sink's declaration cannot be compiled. It is excluded until it is fixed.
    Invalid(String),

    /// The sink is valid but its routing is not (yet) in effect.
    Pending(String),
}

// === impl SinkStatus ===

impl SinkStatus {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Ready => "Ready",
            Self::Invalid(_) => "Invalid",
            Self::Pending(_) => "Pending",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Ready => "Sink configuration has been applied",
            Self::Invalid(message) | Self::Pending(message) => message,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Combines the status of a sink on two targets: `Invalid` wins over `Pending`, which wins
    /// over `Ready`.
    pub fn merge(self, other: Self) -> Self {
        match (self, other) {
            (s @ Self::Invalid(_), _) | (_, s @ Self::Invalid(_)) => s,
            (s @ Self::Pending(_), _) | (_, s @ Self::Pending(_)) => s,
            (Self::Ready, Self::Ready) => Self::Ready,
        }
    }
}

impl fmt::Display for SinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reason(), self.message())
    }
}
