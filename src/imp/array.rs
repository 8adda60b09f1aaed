use core::{
    alloc::Layout,
    marker::PhantomData,
    mem,
    ptr::NonNull,
};
use std::alloc;

use crate::{ReserveStrategy, TryReserveError};

/// Low level utility for more ergonomically allocating, reallocating, and
/// deallocating the buffer backing a dynamic array, without having to worry
/// about all the corner cases involved. In particular:
///
/// - Produces a dangling pointer for zero-sized types.
/// - Produces a dangling pointer for zero-length allocations.
/// - Avoids freeing a dangling pointer.
/// - Catches all overflows in capacity computations (promotes them to
///   "capacity overflow" errors).
/// - Grows to exactly the computed target capacity, never "at least".
///
/// This type does not in any way inspect the memory it manages. When dropped
/// it *will* free its memory, but it *won't* try to drop its contents. It is
/// up to the user of `RawArray` to handle the actual things *stored* inside.
///
/// Note that a zero-sized type never allocates, so `capacity()` always
/// returns `usize::MAX` for those.
pub(crate) struct RawArray<T, R: ReserveStrategy> {
    ptr: NonNull<T>,
    cap: usize,
    _phantom: PhantomData<R>,
}

unsafe impl<T: Send, R: ReserveStrategy> Send for RawArray<T, R> {}
unsafe impl<T: Sync, R: ReserveStrategy> Sync for RawArray<T, R> {}

impl<T, R: ReserveStrategy> RawArray<T, R> {
    /// Creates the biggest possible `RawArray` without allocating.
    /// If `T` has a non-zero size, this makes a `RawArray` with a capacity of 0.
    /// If `T` is zero-sized, it makes a `RawArray` with a capacity of `usize::MAX`.
    /// Useful for implementing delayed allocation.
    #[must_use]
    pub const fn new() -> Self {
        Self { ptr: NonNull::dangling(), cap: 0, _phantom: PhantomData }
    }

    /// Creates a `RawArray` with exactly the capacity and alignment requirements of a `[T; capacity]`.
    /// This is equivalent to calling `RawArray::new` when `capacity` is 0 or `T` is zero-sized.
    ///
    /// # Panics
    ///
    /// Panics if the requested capacity exceeds `isize::MAX` bytes.
    ///
    /// # Aborts
    ///
    /// Aborts on OOM.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        match Self::try_with_capacity(capacity) {
            Ok(arr) => arr,
            Err(err) => handle_error(err),
        }
    }

    /// Tries to create a `RawArray` with exactly the capacity and alignment requirements of a `[T; capacity]`.
    ///
    /// # Errors
    ///
    /// Returns an error if the capacity exceeds `isize::MAX` bytes, or if the
    /// allocator reports a failure.
    pub fn try_with_capacity(capacity: usize) -> Result<Self, TryReserveError> {
        // Don't allocate here, `drop` will not deallocate when the capacity is 0.
        if mem::size_of::<T>() == 0 || capacity == 0 {
            return Ok(Self::new());
        }

        let layout = Layout::array::<T>(capacity).map_err(|_| TryReserveError::CapacityOverflow)?;
        if layout.size() > isize::MAX as usize {
            return Err(TryReserveError::CapacityOverflow);
        }

        // SAFETY: `layout` has a non-zero size, both `capacity` and the
        // element size are non-zero on this path.
        let ptr = unsafe { alloc::alloc(layout) };
        let Some(ptr) = NonNull::new(ptr.cast::<T>()) else {
            return Err(TryReserveError::AllocError(layout));
        };

        Ok(Self { ptr, cap: capacity, _phantom: PhantomData })
    }

    /// Get the capacity of the allocation.
    ///
    /// This will always be `usize::MAX` if `T` is zero-sized.
    pub const fn capacity(&self) -> usize {
        if mem::size_of::<T>() == 0 {
            usize::MAX
        } else {
            self.cap
        }
    }

    /// Get a raw pointer to the start of the allocation.
    /// Note that this is a dangling pointer when either `capacity() == 0` or `T` is zero-sized.
    pub const fn ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }

    pub const fn non_null(&self) -> NonNull<T> {
        self.ptr
    }

    /// Create a `RawArray` from a pointer and a capacity.
    ///
    /// # Safety
    ///
    /// - `ptr` needs to have been allocated by a `RawArray<T, _>` with exactly
    ///   `capacity` slots (or be dangling with `capacity == 0`, or any value
    ///   when `T` is zero-sized).
    pub const unsafe fn from_raw_parts(ptr: NonNull<T>, capacity: usize) -> Self {
        Self { ptr, cap: capacity, _phantom: PhantomData }
    }

    /// Ensures that the buffer contains at least enough space to hold `len + additional` elements.
    /// If it doesn't already have enough capacity, will reallocate to the target the reserve strategy computes.
    ///
    /// `len` may not exceed `self.capacity()`.
    ///
    /// # Panics
    ///
    /// Panics if the new capacity exceeds `isize::MAX` bytes.
    ///
    /// # Aborts
    ///
    /// Aborts on OOM.
    pub fn reserve(&mut self, len: usize, additional: usize) {
        // Callers expect this function to be very cheap when there is already
        // sufficient capacity, so all the resizing and error handling logic
        // sits behind a cold call, while this function is likely to be
        // inlined as just a comparison and a call if the comparison fails.
        #[cold]
        fn do_reserve_and_handle<T, R: ReserveStrategy>(
            slf: &mut RawArray<T, R>,
            len: usize,
            additional: usize,
        ) {
            if let Err(err) = slf.grow_amortized(len, additional) {
                handle_error(err);
            }
        }

        if self.needs_to_grow(len, additional) {
            do_reserve_and_handle(self, len, additional);
        }
    }

    /// A specialized version of `self.reserve(len, 1)`, which requires the caller to ensure `len == self.capacity()`.
    pub fn grow_one(&mut self) {
        if let Err(err) = self.grow_amortized(self.capacity(), 1) {
            handle_error(err);
        }
    }

    /// Ensures that the buffer contains at least enough space to hold `len + additional` elements.
    /// If it doesn't already, will reallocate to exactly that amount. This is
    /// the path behind direct user requests, which bypass the reserve strategy.
    ///
    /// `len` may not exceed `self.capacity()`.
    ///
    /// # Panics
    ///
    /// Panics if the new capacity exceeds `isize::MAX` bytes.
    ///
    /// # Aborts
    ///
    /// Aborts on OOM.
    pub fn reserve_exact(&mut self, len: usize, additional: usize) {
        if let Err(err) = self.try_reserve_exact(len, additional) {
            handle_error(err);
        }
    }

    pub fn try_reserve_exact(&mut self, len: usize, additional: usize) -> Result<(), TryReserveError> {
        if self.needs_to_grow(len, additional) {
            self.grow_exact(len, additional)?;
        }
        Ok(())
    }

    /// Shrinks the buffer down to the specified capacity.
    /// If the given amount is 0, actually completely deallocates.
    ///
    /// # Panics
    ///
    /// Panics if the given amount is *larger* than the current capacity.
    ///
    /// # Aborts
    ///
    /// Aborts on OOM.
    pub fn shrink_to_fit(&mut self, cap: usize) {
        if let Err(err) = self.shrink(cap) {
            handle_error(err);
        }
    }

    //--------------------------------------------------------------

    /// Returns if the buffer needs to grow to fulfill the needed extra capacity.
    /// Mainly used to make inlining reserve calls possible without inlining `grow`.
    fn needs_to_grow(&self, len: usize, additional: usize) -> bool {
        additional > self.capacity().wrapping_sub(len)
    }

    fn current_memory(&self) -> Option<(NonNull<u8>, Layout)> {
        if mem::size_of::<T>() == 0 || self.cap == 0 {
            None
        } else {
            // The layout was validated when the block was allocated, so it
            // cannot overflow here.
            debug_assert!(mem::size_of::<T>() % mem::align_of::<T>() == 0);
            unsafe {
                let size = mem::size_of::<T>() * self.cap;
                let layout = Layout::from_size_align_unchecked(size, mem::align_of::<T>());
                Some((self.ptr.cast(), layout))
            }
        }
    }

    fn grow_amortized(&mut self, len: usize, additional: usize) -> Result<(), TryReserveError> {
        debug_assert!(additional > 0);

        if mem::size_of::<T>() == 0 {
            // Since the capacity is reported as `usize::MAX` for zero-sized
            // types, getting here necessarily means the `RawArray` is overfull.
            return Err(TryReserveError::CapacityOverflow);
        }

        let required_cap = len.checked_add(additional).ok_or(TryReserveError::CapacityOverflow)?;
        let new_cap = R::calculate(self.cap, required_cap).map_err(|_| TryReserveError::CapacityOverflow)?;
        // `ReserveStrategy` is a safe trait; a result below the required
        // capacity must not be able to shrink the live region.
        let new_cap = usize::max(new_cap, required_cap);

        self.finalize_grow(new_cap)
    }

    fn grow_exact(&mut self, len: usize, additional: usize) -> Result<(), TryReserveError> {
        debug_assert!(additional > 0);

        if mem::size_of::<T>() == 0 {
            return Err(TryReserveError::CapacityOverflow);
        }

        let new_cap = len.checked_add(additional).ok_or(TryReserveError::CapacityOverflow)?;
        self.finalize_grow(new_cap)
    }

    fn shrink(&mut self, cap: usize) -> Result<(), TryReserveError> {
        assert!(cap <= self.capacity(), "Tried to shrink to a larger capacity");

        let Some((ptr, layout)) = self.current_memory() else {
            return Ok(());
        };

        if cap == 0 {
            // SAFETY: `ptr` was allocated with `layout` by this array.
            unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
            self.ptr = NonNull::dangling();
            self.cap = 0;
        } else {
            // Cannot overflow, `cap` is below the already-validated capacity.
            let new_size = cap * mem::size_of::<T>();
            // SAFETY: `ptr` was allocated with `layout`, and `new_size` is
            // non-zero and no larger than the old size.
            let new_ptr = unsafe { alloc::realloc(ptr.as_ptr(), layout, new_size) };
            let Some(new_ptr) = NonNull::new(new_ptr.cast::<T>()) else {
                let layout = unsafe { Layout::from_size_align_unchecked(new_size, mem::align_of::<T>()) };
                return Err(TryReserveError::AllocError(layout));
            };
            self.ptr = new_ptr;
            self.cap = cap;
        }

        Ok(())
    }

    fn finalize_grow(&mut self, new_cap: usize) -> Result<(), TryReserveError> {
        debug_assert!(new_cap >= self.cap);

        let new_layout = Layout::array::<T>(new_cap).map_err(|_| TryReserveError::CapacityOverflow)?;
        if new_layout.size() > isize::MAX as usize {
            return Err(TryReserveError::CapacityOverflow);
        }

        let new_ptr = match self.current_memory() {
            // SAFETY: `new_layout` has a non-zero size, `T` is not zero-sized
            // on the grow paths and `new_cap` is at least 1.
            None => unsafe { alloc::alloc(new_layout) },
            // SAFETY: `ptr` was allocated with `old_layout`, and the new size
            // was validated above. `realloc` carries the live prefix over bit
            // for bit.
            Some((ptr, old_layout)) => unsafe {
                debug_assert_eq!(old_layout.align(), new_layout.align());
                alloc::realloc(ptr.as_ptr(), old_layout, new_layout.size())
            },
        };

        let Some(new_ptr) = NonNull::new(new_ptr.cast::<T>()) else {
            // The old block is still intact when the allocator fails, so the
            // array is left in its prior state.
            return Err(TryReserveError::AllocError(new_layout));
        };

        self.ptr = new_ptr;
        self.cap = new_cap;
        Ok(())
    }
}

impl<T, R: ReserveStrategy> Drop for RawArray<T, R> {
    fn drop(&mut self) {
        if let Some((ptr, layout)) = self.current_memory() {
            // SAFETY: `ptr` was allocated with `layout` by this array.
            unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
        }
    }
}

/// Central function for reserve error handling.
#[cold]
fn handle_error(e: TryReserveError) -> ! {
    match e {
        TryReserveError::CapacityOverflow => capacity_overflow(),
        TryReserveError::AllocError(layout) => alloc::handle_alloc_error(layout),
    }
}

fn capacity_overflow() -> ! {
    panic!("capacity overflow");
}
