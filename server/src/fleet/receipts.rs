//! Receipts issued by the simulator and not yet completed

use fleet_shared::ReceiptId;
use std::collections::HashSet;
use tokio::sync::Mutex;

/// Outstanding receipts of one client session
#[derive(Default)]
pub struct ReceiptBook {
    outstanding: Mutex<HashSet<ReceiptId>>,
}

impl ReceiptBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a receipt handed out to the client
    pub async fn issue(&self, receipt: ReceiptId) {
        self.outstanding.lock().await.insert(receipt);
    }

    /// Claim a receipt for completion; false if it was cancelled or already completed
    pub async fn take(&self, receipt: &ReceiptId) -> bool {
        self.outstanding.lock().await.remove(receipt)
    }

    /// Drop cancelled receipts, returning how many were still outstanding
    pub async fn cancel(&self, receipts: &[ReceiptId]) -> usize {
        let mut outstanding = self.outstanding.lock().await;
        receipts.iter().filter(|r| outstanding.remove(*r)).count()
    }

    pub async fn len(&self) -> usize {
        self.outstanding.lock().await.len()
    }
}
