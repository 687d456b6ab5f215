//! Utility functions for Diffusion Orchestrator
//!
//! This module provides formatting and timeout helpers used throughout the
//! Diffusion Orchestrator system.

use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;

use crate::error::{Error, Result};

/// Formats a byte size into a human-readable string
///
/// # Examples
///
/// ```
/// use common::utils::format_bytes;
///
/// assert_eq!(format_bytes(1024), "1.0 KiB");
/// assert_eq!(format_bytes(1048576), "1.0 MiB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    bytesize::ByteSize::b(bytes).to_string_as(true)
}

/// Formats a duration into a human-readable string
///
/// # Examples
///
/// ```
/// use common::utils::format_duration;
/// use std::time::Duration;
///
/// assert_eq!(format_duration(Duration::from_secs(65)), "1m 5s");
/// assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();

    if total_secs == 0 {
        let millis = duration.subsec_millis();
        if millis == 0 {
            return format!("{}µs", duration.subsec_micros());
        }
        return format!("{}ms", millis);
    }

    let hours = total_secs / (60 * 60);
    let minutes = (total_secs % (60 * 60)) / 60;
    let seconds = total_secs % 60;

    let mut result = String::new();

    if hours > 0 {
        result.push_str(&format!("{}h ", hours));
    }

    if minutes > 0 || !result.is_empty() {
        result.push_str(&format!("{}m ", minutes));
    }

    result.push_str(&format!("{}s", seconds));

    result
}

/// Executes a future with a timeout
///
/// # Examples
///
/// ```
/// use common::utils::execute_with_timeout;
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> common::Result<()> {
/// let value = execute_with_timeout(
///     async { Ok(42) },
///     Duration::from_secs(1),
///     "example operation",
/// ).await?;
/// assert_eq!(value, 42);
/// # Ok(())
/// # }
/// ```
pub async fn execute_with_timeout<T, F>(
    future: F,
    duration: Duration,
    operation_name: &str,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(format!(
            "Operation '{}' timed out after {}",
            operation_name,
            format_duration(duration)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_micros(15)), "15µs");
        assert_eq!(format_duration(Duration::from_secs(3)), "3s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
    }

    #[tokio::test]
    async fn test_execute_with_timeout_expires() {
        let result: Result<()> = execute_with_timeout(
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            Duration::from_millis(10),
            "slow operation",
        )
        .await;

        let err = result.unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("slow operation"));
    }
}
