/// Caller-supplied token collapsing retries of the same logical request.
#[derive(Debug, Clone)]
pub struct IdempotencyKey(String);

const MAX_CHARS: usize = 64;

impl TryFrom<String> for IdempotencyKey {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            anyhow::bail!("idempotency key cannot be empty")
        }
        if value.len() > MAX_CHARS {
            anyhow::bail!("idempotency key cannot be longer than {MAX_CHARS} characters")
        }
        Ok(Self(value))
    }
}

impl AsRef<str> for IdempotencyKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<IdempotencyKey> for String {
    fn from(value: IdempotencyKey) -> Self {
        value.0
    }
}
