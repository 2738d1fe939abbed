// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-handle state: the descriptor and the open instance it hangs off

use crate::live::LiveGuard;
use crate::share_access::ShareReservation;
use crate::{FileObjectFlags, HandleId};

/// Handle-local intent, never shared between handles.
///
/// Obtained from [`crate::Volume::create_file_desc`], which bounds how many
/// can be alive at once.
#[derive(Debug)]
pub struct FileDesc {
    pub delete_on_close: bool,
    _live: LiveGuard,
}

impl FileDesc {
    pub(crate) fn new(live: LiveGuard) -> Self {
        Self {
            delete_on_close: false,
            _live: live,
        }
    }
}

/// One open instance of a node, owned by the caller for the handle's lifetime
#[derive(Debug)]
pub struct FileObject {
    id: HandleId,
    flags: FileObjectFlags,
    pub(crate) reservation: ShareReservation,
    desc: Option<FileDesc>,
}

impl FileObject {
    pub fn new(id: HandleId, flags: FileObjectFlags) -> Self {
        Self {
            id,
            flags,
            reservation: ShareReservation::default(),
            desc: None,
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn flags(&self) -> FileObjectFlags {
        self.flags
    }

    pub fn is_cache_supported(&self) -> bool {
        self.flags.contains(FileObjectFlags::CACHE_SUPPORTED)
    }

    /// The share reservation this handle holds on its node
    pub fn reservation(&self) -> &ShareReservation {
        &self.reservation
    }

    pub fn attach_desc(&mut self, desc: FileDesc) {
        self.desc = Some(desc);
    }

    pub fn desc(&self) -> Option<&FileDesc> {
        self.desc.as_ref()
    }

    pub fn desc_mut(&mut self) -> Option<&mut FileDesc> {
        self.desc.as_mut()
    }

    pub fn take_desc(&mut self) -> Option<FileDesc> {
        self.desc.take()
    }

    pub(crate) fn delete_on_close(&self) -> bool {
        self.desc.as_ref().is_some_and(|d| d.delete_on_close)
    }
}
