//! Bucket key generation.

/// Separator between the operation name and the bucket identifier.
pub const KEY_SEPARATOR: char = '_';

/// A key that uniquely identifies one operation within one window instance.
///
/// Rendered as `{operation}_{bucket}`, which is the string handed to the
/// counter store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    /// The rate-limited operation name
    pub operation: String,
    /// Identifier of the window instance
    pub bucket: i64,
}

impl BucketKey {
    /// Create a new bucket key.
    pub fn new(operation: &str, bucket: i64) -> Self {
        Self {
            operation: operation.to_string(),
            bucket,
        }
    }

    /// Convert the bucket key to its store representation.
    pub fn to_string_key(&self) -> String {
        format!("{}{}{}", self.operation, KEY_SEPARATOR, self.bucket)
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.operation, KEY_SEPARATOR, self.bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_key_to_string() {
        let key = BucketKey::new("login", 28401);
        assert_eq!(key.to_string_key(), "login_28401");
        assert_eq!(key.to_string(), "login_28401");
    }

    #[test]
    fn test_bucket_key_equality() {
        assert_eq!(BucketKey::new("login", 3), BucketKey::new("login", 3));
        assert_ne!(BucketKey::new("login", 3), BucketKey::new("login", 4));
        assert_ne!(BucketKey::new("login", 3), BucketKey::new("logout", 3));
    }

    #[test]
    fn test_operation_with_separator_is_kept_verbatim() {
        let key = BucketKey::new("send_mail", 7);
        assert_eq!(key.to_string_key(), "send_mail_7");
    }
}
