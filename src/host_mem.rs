// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;

use rmi::GRANULE_SIZE;

use crate::{Error, Result};

/// How a host page allocation may behave.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocMode {
    /// The allocator may sleep. Only legal from control paths that hold no address space lock.
    Blocking,
    /// The allocator must not sleep or block, e.g. because an address space lock is held.
    NonBlocking,
}

/// A uniquely owned 4kB page of host memory, named by its physical address.
#[must_use]
#[derive(Debug, PartialEq, Eq)]
pub struct HostPage {
    pa: u64,
}

impl HostPage {
    /// Creates a `HostPage` for the page at `pa`.
    ///
    /// # Safety
    ///
    /// The caller must own the page at `pa` and must not create another `HostPage` for it.
    pub unsafe fn from_phys(pa: u64) -> Self {
        Self { pa }
    }

    /// Returns the physical address of the page.
    pub fn pa(&self) -> u64 {
        self.pa
    }
}

/// The host's page allocator and its linear map.
pub trait HostMemory {
    /// Allocates one zeroed page.
    fn alloc_page(&self, mode: AllocMode) -> Option<HostPage>;

    /// Returns `page` to the allocator. The page must not be delegated.
    fn free_page(&self, page: HostPage);

    /// Returns the host virtual address of the physical address `pa`.
    fn phys_to_virt(&self, pa: u64) -> *mut u8;

    /// Returns the physical address backing the host virtual address `va`.
    fn virt_to_phys(&self, va: *const u8) -> u64;

    /// Allocates a page, failing with `OutOfMemory` if none is available.
    fn try_alloc_page(&self, mode: AllocMode) -> Result<HostPage> {
        self.alloc_page(mode).ok_or(Error::OutOfMemory)
    }
}

/// A Box-like container that keeps a `T` in a host page of its own. Used for the structures the
/// monitor reads or writes by physical address.
///
/// Note that `drop` runs `T`'s destructor but leaks the page; use `release` to give it back to
/// the allocator.
pub struct HostPageBox<T> {
    ptr: NonNull<T>,
    pa: u64,
}

impl<T> HostPageBox<T> {
    /// Moves `data` into `page`.
    pub fn new_with<H: HostMemory + ?Sized>(data: T, page: HostPage, mem: &H) -> Self {
        assert!(core::mem::size_of::<T>() <= GRANULE_SIZE as usize);
        let pa = page.pa();
        let ptr = NonNull::new(mem.phys_to_virt(pa) as *mut T);
        // Explicitly ban pages at a zero virtual address.
        let ptr = ptr.unwrap_or_else(|| panic!("Host page {pa:#x} has no linear mapping"));
        unsafe {
            // Safe as the page is uniquely owned, page aligned, and large enough to hold a `T`.
            core::ptr::write(ptr.as_ptr(), data);
        }
        Self { ptr, pa }
    }

    /// Allocates a page and moves `data` into it.
    pub fn new_in<H: HostMemory + ?Sized>(data: T, mem: &H, mode: AllocMode) -> Result<Self> {
        let page = mem.try_alloc_page(mode)?;
        Ok(Self::new_with(data, page, mem))
    }

    /// Returns the physical address of the backing page.
    pub fn pa(&self) -> u64 {
        self.pa
    }

    /// Drops the contained data and returns the backing page.
    pub fn into_page(self) -> HostPage {
        let pa = self.pa;
        // Safe because self owns the page it was built with and the data is valid; forgetting
        // self afterwards keeps the data from being dropped twice.
        unsafe {
            core::ptr::drop_in_place(self.ptr.as_ptr());
            core::mem::forget(self);
            HostPage::from_phys(pa)
        }
    }

    /// Drops the contained data and frees the backing page.
    pub fn release<H: HostMemory + ?Sized>(self, mem: &H) {
        mem.free_page(self.into_page());
    }
}

impl<T> Drop for HostPageBox<T> {
    /// Drop can't return the backing memory so it is leaked, however it will run `T`'s destructor.
    fn drop(&mut self) {
        // Safe because self owns the page and the data in it is valid.
        unsafe {
            core::ptr::drop_in_place(self.ptr.as_ptr());
        }
    }
}

impl<T> Deref for HostPageBox<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safe because this pointer is guaranteed to be valid in the constructor.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for HostPageBox<T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safe because this pointer is guaranteed to be valid in the constructor.
        unsafe { self.ptr.as_mut() }
    }
}

// Safety: Like Box<T>, HostPageBox<T> is Send/Sync iff T is Send/Sync.
unsafe impl<T> Send for HostPageBox<T> where T: Send {}
unsafe impl<T> Sync for HostPageBox<T> where T: Sync {}
