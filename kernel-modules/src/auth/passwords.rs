use kernel_core::error::{KernelError, KernelResult};

const MIN_LEN: usize = 8;
const MAX_LEN: usize = 128;

/// Length 8..128, at least one uppercase, one lowercase, one digit.
/// Special characters are welcome but not required.
pub fn validate_policy(password: &str) -> KernelResult<()> {
    let len = password.chars().count();
    if len < MIN_LEN || len > MAX_LEN {
        return Err(KernelError::InvalidInput(format!("password must be {MIN_LEN}..{MAX_LEN} characters")));
    }
    let has_upper = password.chars().any(|c| c.is_ascii_uppercase());
    let has_lower = password.chars().any(|c| c.is_ascii_lowercase());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    if !(has_upper && has_lower && has_digit) {
        return Err(KernelError::InvalidInput(
            "password must contain an uppercase letter, a lowercase letter, and a digit".into(),
        ));
    }
    Ok(())
}

/// Hashes on a blocking thread — bcrypt is deliberately slow and would
/// otherwise stall the cooperative scheduler.
pub async fn hash(password: &str) -> KernelResult<String> {
    validate_policy(password)?;
    let password = password.to_string();
    tokio::task::spawn_blocking(move || bcrypt::hash(password, bcrypt::DEFAULT_COST))
        .await
        .map_err(|e| KernelError::Internal(e.into()))?
        .map_err(|e| KernelError::Internal(e.into()))
}

pub async fn verify(password: &str, hash: &str) -> KernelResult<bool> {
    let password = password.to_string();
    let hash = hash.to_string();
    tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
        .await
        .map_err(|e| KernelError::Internal(e.into()))?
        .map_err(|e| KernelError::Internal(e.into()))
}
