//! Fibonacci job handler

use async_trait::async_trait;
use consumer_pipeline::{HandlerError, MessageHandler};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::info;

/// Topic the Fibonacci jobs are published to
pub const TOPIC: &str = "Fibonacci";

/// Digits of the result included in the completion log
const LOGGED_DIGITS: usize = 32;

/// Base of one limb; each limb holds nine decimal digits
const LIMB_BASE: u32 = 1_000_000_000;

/// Job payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FibonacciData {
    pub iterations: u32,
}

/// Result of one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FibonacciResult {
    /// Decimal rendering of F(iterations)
    pub number: String,
    /// Number of decimal digits in `number`
    pub length: usize,
    pub iterations: u32,
}

/// Compute F(n) with F(1) = F(2) = 1.
///
/// `None` when n is 0.
pub fn iterate(iterations: u32) -> Option<FibonacciResult> {
    if iterations == 0 {
        return None;
    }

    // little-endian limbs
    let (mut previous, mut current) = (vec![0u32], vec![1u32]);
    for _ in 1..iterations {
        add_assign(&mut previous, &current);
        std::mem::swap(&mut previous, &mut current);
    }

    let number = to_decimal(&current);
    Some(FibonacciResult {
        length: number.len(),
        number,
        iterations,
    })
}

fn add_assign(sum: &mut Vec<u32>, addend: &[u32]) {
    if sum.len() < addend.len() {
        sum.resize(addend.len(), 0);
    }

    let mut carry = 0;
    for (index, limb) in sum.iter_mut().enumerate() {
        let total = *limb + addend.get(index).copied().unwrap_or(0) + carry;
        if total >= LIMB_BASE {
            *limb = total - LIMB_BASE;
            carry = 1;
        } else {
            *limb = total;
            carry = 0;
        }
    }
    if carry > 0 {
        sum.push(carry);
    }
}

fn to_decimal(limbs: &[u32]) -> String {
    let mut digits = limbs.iter().rev();
    let mut out = digits.next().map(u32::to_string).unwrap_or_default();
    for limb in digits {
        out.push_str(&format!("{:09}", limb));
    }
    out
}

pub struct FibonacciHandler;

#[async_trait]
impl MessageHandler for FibonacciHandler {
    type Payload = FibonacciData;

    async fn handle(&self, job: FibonacciData) -> Result<(), HandlerError> {
        info!(iterations = job.iterations, "FibonacciConsumer received message");

        let started = Instant::now();
        let iterations = job.iterations;
        let result = tokio::task::spawn_blocking(move || iterate(iterations))
            .await
            .map_err(|e| HandlerError::new("Fibonacci computation aborted").with_cause(e))?
            // same input fails the same way on every attempt
            .ok_or_else(|| HandlerError::permanent("iterations must be at least 1, got 0"))?;

        info!(
            iterations = result.iterations,
            leading_digits = %&result.number[..result.length.min(LOGGED_DIGITS)],
            length = result.length,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Fibonacci result computed"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "FibonacciConsumer"
    }
}
