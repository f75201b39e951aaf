// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Coordination primitives for in-process resource management
//!
//! This module provides:
//! - **LockManager** - Exclusive/shared locks with wait-for-graph deadlock prevention
//! - **ConcurrencyLimiter** - Global plus per-category admission control
//! - **ResourceQueue** - Single-owner priority arbitration
//! - **MaintenanceTask** - Periodic sweep of expired grants and slots

pub mod limiter;
pub mod lock;
pub mod lock_manager;
pub mod maintenance;
pub mod resource_queue;

pub use limiter::{AdmissionSlot, CategoryStatus, ConcurrencyLimiter, LimiterStatus, SlotGuard};
pub use lock::{HolderId, LockMode, LockRecord, LockTable};
pub use lock_manager::{LockGuard, LockManager, LockOutcome, LockStatus, ResourceLockStatus};
pub use maintenance::{MaintenanceConfig, MaintenanceTask, SweepStats};
pub use resource_queue::{QueueStatus, ResourceGuard, ResourceQueue, ResourceQueueStatus};
