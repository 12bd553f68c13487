//! AIO completion tokens.
//!
//! A token stands for one not-yet-delivered completion.  The cache uses
//! them in two roles: the **in-flight token** driving an entry's device
//! fetch, and **waiter tokens** handed to callers that joined a fetch
//! already in progress.  Waiter tokens chain into a per-entry list through
//! their `prev`/`next` links; the fan-out walks that list in registration
//! order.
//!
//! Tokens live in a header-only [`Mempool`] (no data area), so token
//! exhaustion surfaces as `pick() == None` and maps to `EAGAIN` upstream.

use core::cell::Cell;

use shfs_mm::{Mempool, ObjId, PoolError, PoolLayout};

use crate::cache::EntryRef;

/// Completion callback: `(ret, cookie, argp)`.
///
/// `ret` is the byte count on success or a negative errno; the two words
/// are the caller's context, carried through untouched.
pub type AioNotify = fn(ret: i64, cookie: usize, argp: usize);

/// Identifier of a token within the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TokenId(ObjId);

impl TokenId {
    #[inline]
    pub(crate) fn tag(self) -> u64 {
        self.0 as u64
    }

    #[inline]
    pub(crate) fn from_tag(tag: u64) -> Self {
        Self(tag as ObjId)
    }
}

pub struct AioToken {
    pub(crate) cb: Cell<Option<AioNotify>>,
    pub(crate) cb_cookie: Cell<usize>,
    pub(crate) cb_argp: Cell<usize>,
    pub(crate) ret: Cell<i64>,
    pub(crate) infly: Cell<bool>,
    /// Waiter-chain links (token indices).
    pub(crate) prev: Cell<Option<TokenId>>,
    pub(crate) next: Cell<Option<TokenId>>,
    /// Entry this token is fetching for; set on in-flight tokens only.
    pub(crate) owner: Cell<Option<EntryRef>>,
}

impl AioToken {
    fn new() -> Self {
        Self {
            cb: Cell::new(None),
            cb_cookie: Cell::new(0),
            cb_argp: Cell::new(0),
            ret: Cell::new(0),
            infly: Cell::new(false),
            prev: Cell::new(None),
            next: Cell::new(None),
            owner: Cell::new(None),
        }
    }

    pub(crate) fn set_callback(&self, cb: Option<AioNotify>, cookie: usize, argp: usize) {
        self.cb.set(cb);
        self.cb_cookie.set(cookie);
        self.cb_argp.set(argp);
    }

    /// Completion result; meaningful once the token is no longer in flight.
    #[inline]
    pub fn ret(&self) -> i64 {
        self.ret.get()
    }

    #[inline]
    pub fn is_infly(&self) -> bool {
        self.infly.get()
    }
}

pub struct AioTokenPool {
    pool: Mempool<AioToken>,
}

impl AioTokenPool {
    pub fn new(nb_tokens: u32) -> Result<Self, PoolError> {
        let pool = Mempool::new(
            nb_tokens,
            0,
            0,
            0,
            0,
            PoolLayout::Interleaved,
            |_, _| AioToken::new(),
        )?;
        Ok(Self { pool })
    }

    /// Take a token, already marked in flight, or `None` on exhaustion.
    pub fn pick(&mut self) -> Option<TokenId> {
        let id = self.pool.pick()?;
        let token = self.pool.private(id);
        token.cb.set(None);
        token.cb_cookie.set(0);
        token.cb_argp.set(0);
        token.ret.set(0);
        token.infly.set(true);
        token.prev.set(None);
        token.next.set(None);
        token.owner.set(None);
        Some(TokenId(id))
    }

    /// Recycle a token.
    pub fn put(&mut self, t: TokenId) {
        let token = self.pool.private(t.0);
        token.infly.set(false);
        token.owner.set(None);
        self.pool.put(t.0);
    }

    #[inline]
    pub fn token(&self, t: TokenId) -> &AioToken {
        self.pool.private(t.0)
    }

    /// Whether the completion for `t` has fired. A missing token counts
    /// as done.
    #[inline]
    pub fn is_done(&self, t: Option<TokenId>) -> bool {
        match t {
            None => true,
            Some(t) => !self.token(t).infly.get(),
        }
    }

    /// Read the completion result and mark the token no longer in flight.
    pub fn finalize(&self, t: TokenId) -> i64 {
        let token = self.token(t);
        token.infly.set(false);
        token.ret.get()
    }

    #[inline]
    pub fn free_count(&self) -> u32 {
        self.pool.free_count()
    }

    #[inline]
    pub fn total(&self) -> u32 {
        self.pool.total()
    }
}
