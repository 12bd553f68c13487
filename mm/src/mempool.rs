//! Fixed-count object pool with headroom/tailroom-carrying buffer slots.
//!
//! Each pool object is the unit `{private header, headroom, data,
//! tailroom}` with the data area aligned to the pool's data alignment.
//! Two layouts are supported:
//!
//! * **Interleaved** — one contiguous region; each slot's private header
//!   immediately precedes its headroom and data.  Used for header-only
//!   pools (e.g. AIO tokens, `obj_size == 0`).
//! * **Separated** — private headers packed apart, all data slots in a
//!   second region allocated with the data alignment.  Used for chunk
//!   buffers, where the data alignment (device I/O alignment) is much
//!   larger than the header's.
//!
//! Free objects are tracked by index in a power-of-two ring sized to hold
//! every object.  `pick` returning `None` is the pool's back-pressure
//! signal; callers decide whether to retry, steal, or fail with `EAGAIN`.

use core::marker::PhantomData;
use core::mem;
use core::ptr;

use alloc::vec::Vec;

use shfs_lib::{IndexRing, align_up, is_pow2, log_debug};

use crate::MIN_ALIGN;
use crate::region::AlignedRegion;

/// Index of an object within its pool.
pub type ObjId = u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolError {
    NoMemory,
    BadAlign,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolLayout {
    Interleaved,
    Separated,
}

enum Headers<P> {
    /// Headers live in the slot region, at each slot's base.
    Inline(PhantomData<P>),
    /// Headers packed in their own vector, apart from the data region.
    Packed(Vec<P>),
}

pub struct Mempool<P> {
    nb_objs: u32,
    obj_size: usize,
    headroom: usize,
    tailroom: usize,
    data_align: usize,
    /// Distance between consecutive slots in the slot region.
    stride: usize,
    /// Offset of the data area within a slot.
    data_offset: usize,
    region: AlignedRegion,
    headers: Headers<P>,
    free: IndexRing,
}

impl<P> Mempool<P> {
    /// Build a pool of `nb_objs` objects whose data areas are `obj_size`
    /// bytes aligned to `data_align`, with the requested head- and
    /// tailroom.  `init` runs once per object with its index and data
    /// pointer and produces the private header.
    ///
    /// `data_align` is floored at [`MIN_ALIGN`] and must be a power of two.
    pub fn new(
        nb_objs: u32,
        obj_size: usize,
        data_align: usize,
        headroom: usize,
        tailroom: usize,
        layout: PoolLayout,
        mut init: impl FnMut(ObjId, *mut u8) -> P,
    ) -> Result<Self, PoolError> {
        let data_align = data_align.max(MIN_ALIGN);
        if !is_pow2(data_align) {
            return Err(PoolError::BadAlign);
        }
        if mem::align_of::<P>() > MIN_ALIGN {
            return Err(PoolError::BadAlign);
        }

        let header_span = align_up(mem::size_of::<P>(), MIN_ALIGN);

        // Slot arithmetic: align the data area within the slot, then pad
        // the whole slot so every slot base keeps the data alignment.
        // Leftover padding is credited to the tailroom.
        let (stride, data_offset) = match layout {
            PoolLayout::Interleaved => {
                let head = align_up(header_span + headroom, data_align) - header_span;
                let stride = align_up(header_span + head + obj_size + tailroom, data_align);
                (stride, header_span + head)
            }
            PoolLayout::Separated => {
                let head = align_up(headroom, data_align);
                let stride = align_up(head + obj_size + tailroom, data_align);
                (stride, head)
            }
        };
        let tailroom = stride - data_offset - obj_size;
        let headroom = match layout {
            PoolLayout::Interleaved => data_offset - header_span,
            PoolLayout::Separated => data_offset,
        };

        let region = AlignedRegion::alloc_zeroed(stride * nb_objs as usize, data_align)?;

        log_debug!(
            "mempool: nb_objs={} obj_size={} align={} headroom={} tailroom={} stride={} layout={:?}",
            nb_objs,
            obj_size,
            data_align,
            headroom,
            tailroom,
            stride,
            layout
        );

        let mut pool = Self {
            nb_objs,
            obj_size,
            headroom,
            tailroom,
            data_align,
            stride,
            data_offset,
            region,
            headers: match layout {
                PoolLayout::Interleaved => Headers::Inline(PhantomData),
                PoolLayout::Separated => Headers::Packed(Vec::with_capacity(nb_objs as usize)),
            },
            free: IndexRing::with_capacity_for(nb_objs),
        };

        for i in 0..nb_objs {
            let base = pool.slot_base(i);
            let header = init(i, pool.obj_data(i));
            match &mut pool.headers {
                Headers::Inline(_) => {
                    // SAFETY: slot bases are `data_align >= MIN_ALIGN`
                    // aligned and `header_span >= size_of::<P>()` bytes are
                    // reserved ahead of the headroom.
                    unsafe { ptr::write(base as *mut P, header) };
                }
                Headers::Packed(vec) => vec.push(header),
            }
            // Ring capacity exceeds nb_objs, the enqueue cannot fail.
            pool.free.enqueue(i);
        }

        Ok(pool)
    }

    /// Dequeue a free object, or `None` when the pool is exhausted.
    pub fn pick(&mut self) -> Option<ObjId> {
        self.free.dequeue()
    }

    /// Return a previously picked object to the pool.
    pub fn put(&mut self, obj: ObjId) {
        debug_assert!(obj < self.nb_objs, "put: object index {} out of bounds", obj);
        self.free.enqueue(obj);
    }

    #[inline(always)]
    pub fn free_count(&self) -> u32 {
        self.free.len()
    }

    #[inline(always)]
    pub fn total(&self) -> u32 {
        self.nb_objs
    }

    #[inline(always)]
    pub fn obj_size(&self) -> usize {
        self.obj_size
    }

    #[inline(always)]
    pub fn headroom(&self) -> usize {
        self.headroom
    }

    #[inline(always)]
    pub fn tailroom(&self) -> usize {
        self.tailroom
    }

    #[inline(always)]
    pub fn data_align(&self) -> usize {
        self.data_align
    }

    /// The object's private header.
    pub fn private(&self, obj: ObjId) -> &P {
        debug_assert!(obj < self.nb_objs);
        match &self.headers {
            // SAFETY: written in `new` and never moved; the pool outlives
            // the returned borrow.
            Headers::Inline(_) => unsafe { &*(self.slot_base(obj) as *const P) },
            Headers::Packed(vec) => &vec[obj as usize],
        }
    }

    /// Raw pointer to the first data byte of `obj`, valid for
    /// `obj_size()` bytes (plus tailroom).
    ///
    /// The caller must own the object (picked and not yet put back) and
    /// must not let the pointer outlive the pool.
    #[inline]
    pub fn obj_data(&self, obj: ObjId) -> *mut u8 {
        debug_assert!(obj < self.nb_objs);
        // SAFETY: in-bounds of the slot region by construction.
        unsafe { self.slot_base(obj).add(self.data_offset) }
    }

    #[inline]
    fn slot_base(&self, obj: ObjId) -> *mut u8 {
        // SAFETY: obj < nb_objs, each slot is `stride` bytes.
        unsafe { self.region.as_mut_ptr().add(obj as usize * self.stride) }
    }
}

impl<P> Drop for Mempool<P> {
    fn drop(&mut self) {
        // Releasing a pool with live objects is a programming error.
        assert!(
            self.free.len() == self.nb_objs,
            "mempool dropped with {} object(s) still in use",
            self.nb_objs - self.free.len()
        );
        if matches!(self.headers, Headers::Inline(_)) {
            for i in 0..self.nb_objs {
                // SAFETY: every inline header was written in `new`.
                unsafe { ptr::drop_in_place(self.slot_base(i) as *mut P) };
            }
        }
    }
}
