// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Object reconciliation on top of the transports.

mod collection;
mod data_store;
mod index;
mod object;
mod outbound;
mod state;

pub use collection::{CollectionHandler, ObjectCollection};
pub use data_store::DataStoreReconciler;
pub use index::{BoundLocalObject, IndexHook, ObjectCollectionIndex, ObjectCollectionIndexedBinding};
pub use object::{ObjectHandlers, ObjectUpdate, ObjectWriteState, ReconciledObject};
pub use outbound::{ObjectHandle, OutboundQueue};
pub use state::{FullUpdateState, FullUpdateStateMachine};
