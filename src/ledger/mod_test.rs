use std::collections::HashSet;

use anyhow::Result;

use crate::ledger::{LedgerStore, MemoryLedger};

const CONSUMER: &str = "test-sink";

#[tokio::test]
async fn already_delivered_returns_only_marked_sequences() -> Result<()> {
    let ledger = MemoryLedger::default();

    ledger.mark_delivered(CONSUMER, &[1, 3, 5]).await?;
    let delivered = ledger.already_delivered(CONSUMER, &[1, 2, 3, 4, 5]).await?;

    let expected: HashSet<u64> = [1, 3, 5].into_iter().collect();
    assert_eq!(delivered, expected, "unexpected delivered set, got {:?}, expected {:?}", delivered, expected);
    Ok(())
}

#[tokio::test]
async fn mark_delivered_is_idempotent() -> Result<()> {
    let ledger = MemoryLedger::default();

    ledger.mark_delivered(CONSUMER, &[7]).await?;
    ledger.mark_delivered(CONSUMER, &[7]).await?;
    let delivered = ledger.already_delivered(CONSUMER, &[7]).await?;

    let expected: HashSet<u64> = [7].into_iter().collect();
    assert_eq!(delivered, expected, "unexpected delivered set after double mark, got {:?}", delivered);
    Ok(())
}

#[tokio::test]
async fn consumers_are_isolated() -> Result<()> {
    let ledger = MemoryLedger::default();

    ledger.mark_delivered(CONSUMER, &[1, 2]).await?;
    let delivered = ledger.already_delivered("other-sink", &[1, 2]).await?;

    assert!(delivered.is_empty(), "expected no delivered sequences for other consumer, got {:?}", delivered);
    Ok(())
}

#[tokio::test]
async fn trim_discards_at_or_below_watermark() -> Result<()> {
    let ledger = MemoryLedger::default();

    ledger.mark_delivered(CONSUMER, &[5, 10, 11, 20]).await?;
    ledger.trim(CONSUMER, 10).await?;
    let delivered = ledger.already_delivered(CONSUMER, &[5, 10, 11, 20]).await?;

    let expected: HashSet<u64> = [11, 20].into_iter().collect();
    assert_eq!(delivered, expected, "unexpected delivered set after trim, got {:?}, expected {:?}", delivered, expected);
    Ok(())
}

#[tokio::test]
async fn trimmed_sequences_are_treated_as_new() -> Result<()> {
    let ledger = MemoryLedger::default();

    ledger.mark_delivered(CONSUMER, &[3]).await?;
    ledger.trim(CONSUMER, 3).await?;

    // A lookup below the watermark returns "unknown", not an error, and the
    // sequence may be marked again.
    let delivered = ledger.already_delivered(CONSUMER, &[3]).await?;
    assert!(delivered.is_empty(), "expected trimmed sequence to be unknown, got {:?}", delivered);
    ledger.mark_delivered(CONSUMER, &[3]).await?;
    let delivered = ledger.already_delivered(CONSUMER, &[3]).await?;
    assert_eq!(delivered.len(), 1, "expected re-marked sequence to be delivered again");
    Ok(())
}

#[tokio::test]
async fn trim_at_max_watermark_clears_all_entries() -> Result<()> {
    let ledger = MemoryLedger::default();

    ledger.mark_delivered(CONSUMER, &[1, u64::MAX]).await?;
    ledger.trim(CONSUMER, u64::MAX).await?;
    let delivered = ledger.already_delivered(CONSUMER, &[1, u64::MAX]).await?;

    assert!(delivered.is_empty(), "expected all sequences trimmed, got {:?}", delivered);
    Ok(())
}

#[tokio::test]
async fn trim_of_unknown_consumer_is_a_noop() -> Result<()> {
    let ledger = MemoryLedger::default();
    ledger.trim(CONSUMER, 100).await?;
    Ok(())
}
