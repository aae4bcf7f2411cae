/*! Loop-iteration contexts.

Every loop around a basic block contributes one bit to the context in
which the block is analysed: the block either executes as part of the
*first* iteration of that loop or as part of a later (*steady-state*)
iteration. A block nested in `depth` loops therefore has `2^depth`
contexts, and both the cache analysis and the timing analysis keep a
separate result per context. */

use std::fmt;

/// The iteration of one enclosing loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Iteration {
    /// The first iteration of the loop.
    First,
    /// Any iteration after the first one.
    Steady,
}

/// The stack of iterations of all loops that enclose a block,
/// outermost loop first.
///
/// The stack is encoded as a binary number in which the outermost loop
/// is the most significant bit, a `0` bit stands for the first and a
/// `1` bit for a steady-state iteration. Entering a loop thus doubles
/// the index (plus one in the steady state) and leaving it halves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Context {
    depth: u32,
    index: u64,
}

impl Context {
    /// The context of a block outside of any loop.
    pub const ROOT: Context = Context { depth: 0, index: 0 };

    /// The context of a block inside a loop nested directly in `self`
    /// during iteration `it` of that loop.
    pub fn enter(self, it: Iteration) -> Context {
        assert!(self.depth < 63, "loop nesting too deep");
        Context {
            depth: self.depth + 1,
            index: self.index * 2 + (it == Iteration::Steady) as u64,
        }
    }

    /// The context of the enclosing loop, or `None` for the root.
    pub fn leave(self) -> Option<Context> {
        if self.depth == 0 {
            None
        } else {
            Some(Context {
                depth: self.depth - 1,
                index: self.index / 2,
            })
        }
    }

    /// Build a context from iterations given outermost loop first.
    pub fn from_iterations(its: impl IntoIterator<Item = Iteration>) -> Context {
        its.into_iter().fold(Context::ROOT, Context::enter)
    }

    /// The number of enclosing loops.
    pub fn depth(self) -> usize {
        self.depth as usize
    }

    /// The position of this context among all `2^depth` contexts.
    pub fn index(self) -> usize {
        self.index as usize
    }

    /// The iteration of the innermost enclosing loop.
    pub fn innermost(self) -> Option<Iteration> {
        if self.depth == 0 {
            None
        } else if self.index % 2 == 1 {
            Some(Iteration::Steady)
        } else {
            Some(Iteration::First)
        }
    }

    /// The iterations of all enclosing loops, outermost first.
    pub fn iterations(self) -> impl Iterator<Item = Iteration> {
        (0..self.depth).rev().map(move |k| {
            if (self.index >> k) & 1 == 1 {
                Iteration::Steady
            } else {
                Iteration::First
            }
        })
    }

    /// Enumerate all contexts at nesting depth `depth` in index order.
    pub fn all(depth: usize) -> impl Iterator<Item = Context> {
        assert!(depth < 63, "loop nesting too deep");
        (0..1u64 << depth).map(move |index| Context {
            depth: depth as u32,
            index,
        })
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (k, it) in self.iterations().enumerate() {
            if k > 0 {
                write!(f, ",")?;
            }
            match it {
                Iteration::First => write!(f, "F")?,
                Iteration::Steady => write!(f, "S")?,
            }
        }
        write!(f, "]")
    }
}
