use std::ptr::NonNull;

use crate::{
    tag::{self, Word, MIN_BLOCK_SIZE, WORD_SIZE},
    Pointer,
};

/// Unsafe typed view over one heap block. The heap itself is a raw byte
/// region, so a "block" is nothing more than the address of its header
/// word; this newtype wraps that address and exposes the layout around
/// it. An allocated block looks like this in memory:
///
/// ```text
/// +----------------------------+
/// | header (size | flags)      | <- Block points here, 8 aligned.
/// +----------------------------+
/// |          payload           | <- Returned to the caller, 16 aligned.
/// |            ...             |
/// +----------------------------+
/// ```
///
/// A free block reuses its payload bytes for free-list links and mirrors
/// its header in a footer word, which is what makes backward traversal
/// possible:
///
/// ```text
/// +----------------------------+
/// | header (size | flags)      |
/// +----------------------------+
/// | next free block            | <- First payload word.
/// +----------------------------+
/// | prev free block            | <- Second payload word.
/// +----------------------------+
/// |        unused bytes        |
/// +----------------------------+
/// | footer (== header)         | <- Last word of the block.
/// +----------------------------+
/// ```
///
/// The exception is the mini block, a free block of exactly
/// [`MIN_BLOCK_SIZE`] bytes. Its single payload word only has room for
/// the `next` link, so it carries no `prev` link and no footer. A
/// neighbor that needs to step backwards over a mini block relies on the
/// `prev_mini` header bit instead of a footer, since the mini size is
/// known.
///
/// Copying the view is free, the heap bytes are the only state.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Block(pub NonNull<Word>);

impl Block {
    /// Returns the block whose payload starts at `address`.
    ///
    /// # Safety
    ///
    /// `address` must point exactly one header word past a valid block
    /// header. Payload pointers previously handed out by the allocator
    /// satisfy this.
    #[inline]
    pub unsafe fn from_payload(address: NonNull<u8>) -> Self {
        Self(NonNull::new_unchecked(
            address.cast::<Word>().as_ptr().offset(-1),
        ))
    }

    /// First payload byte, the address handed out to callers.
    #[inline]
    pub fn payload(self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.0.as_ptr().offset(1)).cast() }
    }

    /// Address of the header word, for bounds and alignment checks.
    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    pub unsafe fn header(self) -> Word {
        self.0.as_ptr().read()
    }

    #[inline]
    pub unsafe fn set_header(self, word: Word) {
        self.0.as_ptr().write(word);
    }

    /// Block size in bytes, header included.
    #[inline]
    pub unsafe fn size(self) -> usize {
        tag::size_of(self.header())
    }

    /// Bytes usable by the caller.
    #[inline]
    pub unsafe fn payload_size(self) -> usize {
        self.size() - WORD_SIZE
    }

    #[inline]
    pub unsafe fn is_alloc(self) -> bool {
        tag::is_alloc(self.header())
    }

    #[inline]
    pub unsafe fn prev_alloc(self) -> bool {
        tag::prev_alloc_of(self.header())
    }

    #[inline]
    pub unsafe fn prev_mini(self) -> bool {
        tag::prev_mini_of(self.header())
    }

    /// Whether a free block of this size is stored footerless.
    #[inline]
    pub unsafe fn is_mini(self) -> bool {
        self.size() == MIN_BLOCK_SIZE
    }

    /// The physically following block.
    ///
    /// # Safety
    ///
    /// Must not be called on the epilogue, there is nothing after it.
    #[inline]
    pub unsafe fn next(self) -> Block {
        Self(NonNull::new_unchecked(
            self.0.as_ptr().cast::<u8>().add(self.size()).cast(),
        ))
    }

    /// The physically preceding block, located through the footer it
    /// left behind, or through the `prev_mini` bit when the predecessor
    /// is a footerless mini block.
    ///
    /// # Safety
    ///
    /// May only be called when `prev_alloc()` is false: allocated
    /// predecessors write no footer.
    pub unsafe fn prev(self) -> Block {
        debug_assert!(!self.prev_alloc());

        if self.prev_mini() {
            return Self(NonNull::new_unchecked(
                self.0.as_ptr().cast::<u8>().sub(MIN_BLOCK_SIZE).cast(),
            ));
        }

        let footer = self.0.as_ptr().offset(-1).read();

        Self(NonNull::new_unchecked(
            self.0.as_ptr().cast::<u8>().sub(tag::size_of(footer)).cast(),
        ))
    }

    /// Footer word of this block. Only free non-mini blocks have one.
    #[inline]
    unsafe fn footer(self) -> *mut Word {
        self.0.as_ptr().cast::<u8>().add(self.size() - WORD_SIZE).cast()
    }

    /// Reads the footer word. Only meaningful on free non-mini blocks.
    pub unsafe fn footer_word(self) -> Word {
        self.footer().read()
    }

    /// Writes this block's header with the given size and allocation
    /// status, carrying over the `prev_alloc`/`prev_mini` bits already
    /// present. A footer is written only when the new state is free and
    /// the block is larger than a mini block; allocating a block
    /// reclaims the footer word for payload.
    pub unsafe fn write(self, size: usize, alloc: bool) {
        let prev_alloc = self.prev_alloc();
        let prev_mini = self.prev_mini();
        self.write_with_prev(size, alloc, prev_alloc, prev_mini);
    }

    /// Same as [`Self::write`] but with explicit predecessor bits, for
    /// headers that don't exist yet (a tail carved out of a split).
    pub unsafe fn write_with_prev(
        self,
        size: usize,
        alloc: bool,
        prev_alloc: bool,
        prev_mini: bool,
    ) {
        let word = tag::pack(size, alloc, prev_alloc, prev_mini);
        self.set_header(word);

        if !alloc && size > MIN_BLOCK_SIZE {
            self.footer().write(word);
        }
    }

    /// Updates the `prev_alloc` bit of this block's header, mirroring
    /// the change into the footer when one exists so that the two words
    /// never disagree.
    pub unsafe fn set_prev_alloc(self, prev_alloc: bool) {
        let header = self.header();
        self.write_with_prev(
            tag::size_of(header),
            tag::is_alloc(header),
            prev_alloc,
            tag::prev_mini_of(header),
        );
    }

    /// Updates the `prev_mini` bit, same footer rule as
    /// [`Self::set_prev_alloc`].
    pub unsafe fn set_prev_mini(self, prev_mini: bool) {
        let header = self.header();
        self.write_with_prev(
            tag::size_of(header),
            tag::is_alloc(header),
            tag::prev_alloc_of(header),
            prev_mini,
        );
    }

    /// Free-list link slots live in the payload: slot 0 holds `next`,
    /// slot 1 holds `prev`. Links are stored as nullable pointers so
    /// that provenance survives the round trip through heap memory.
    #[inline]
    unsafe fn link_slot(self, slot: usize) -> *mut Pointer<Word> {
        self.0.as_ptr().add(1 + slot).cast()
    }

    /// `next` link of a free block. Valid for mini and non-mini blocks.
    #[inline]
    pub unsafe fn next_free(self) -> Option<Block> {
        (*self.link_slot(0)).map(Block)
    }

    #[inline]
    pub unsafe fn set_next_free(self, link: Option<Block>) {
        *self.link_slot(0) = link.map(|block| block.0);
    }

    /// `prev` link of a free block. Mini blocks have no second payload
    /// word, so this must never be touched on them.
    #[inline]
    pub unsafe fn prev_free(self) -> Option<Block> {
        debug_assert!(!self.is_mini());
        (*self.link_slot(1)).map(Block)
    }

    #[inline]
    pub unsafe fn set_prev_free(self, link: Option<Block>) {
        debug_assert!(!self.is_mini());
        *self.link_slot(1) = link.map(|block| block.0);
    }
}
