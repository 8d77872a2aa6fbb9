use crate::error::ChatError;

/// Character bounds applied to trimmed user input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageLimits {
    pub min_chars: usize,
    pub max_chars: usize,
}

impl Default for MessageLimits {
    fn default() -> Self {
        Self {
            min_chars: 3,
            max_chars: 1_000,
        }
    }
}

impl MessageLimits {
    /// Validate raw input and return the trimmed message.
    pub fn validate<'a>(&self, raw: &'a str) -> Result<&'a str, ChatError> {
        let trimmed = raw.trim();
        let chars = trimmed.chars().count();
        if chars == 0 {
            return Err(ChatError::validation(
                "empty_message",
                "Please enter a message.",
            ));
        }
        if chars < self.min_chars {
            return Err(ChatError::validation(
                "message_too_short",
                format!(
                    "Message too short. Please enter at least {} characters.",
                    self.min_chars
                ),
            ));
        }
        if chars > self.max_chars {
            return Err(ChatError::validation(
                "message_too_long",
                format!(
                    "Message too long. Please keep it under {} characters.",
                    self.max_chars
                ),
            ));
        }
        Ok(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_message_within_bounds_and_trims() {
        let limits = MessageLimits::default();
        assert_eq!(limits.validate("  hey  ").expect("valid"), "hey");
    }

    #[test]
    fn rejects_empty_short_and_long_input() {
        let limits = MessageLimits::default();
        assert_eq!(
            limits.validate("   ").expect_err("empty").code,
            "empty_message"
        );
        assert_eq!(
            limits.validate("hi").expect_err("short").message,
            "Message too short. Please enter at least 3 characters."
        );
        let long = "a".repeat(1_001);
        assert_eq!(
            limits.validate(&long).expect_err("long").message,
            "Message too long. Please keep it under 1000 characters."
        );
        assert!(limits.validate(&"a".repeat(1_000)).is_ok());
    }

    #[test]
    fn counts_characters_not_bytes() {
        let limits = MessageLimits {
            min_chars: 3,
            max_chars: 3,
        };
        assert!(limits.validate("ééé").is_ok());
    }
}
