use core::fmt::{self, Debug, Display};

/// A fixed-capacity thread name, kept inline so the thread descriptor
/// never allocates while holding scheduler state.
#[derive(Clone, PartialEq, Eq)]
pub struct Name(heapless::String<64>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameTooLong;

impl Name {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl TryFrom<&str> for Name {
    type Error = NameTooLong;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        heapless::String::try_from(value)
            .map(Self)
            .map_err(|_| NameTooLong)
    }
}

impl Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({:?})", self.0.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::Name;

    #[test]
    fn rejects_oversized_names() {
        assert!(Name::try_from("idle").is_ok());
        let long = "x".repeat(65);
        assert!(Name::try_from(long.as_str()).is_err());
    }
}
