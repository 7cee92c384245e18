//! Small enums shared by kernels and drivers

use serde::{Deserialize, Serialize};

/// Transposition applied to a tile operand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Op {
    NoTrans,
    Trans,
    ConjTrans,
}

impl Op {
    /// Whether rows and columns are exchanged
    #[inline]
    pub fn is_transposed(self) -> bool {
        !matches!(self, Op::NoTrans)
    }
}

/// Side of a triangular operand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Left,
    Right,
}

/// Which part of a matrix is stored or referenced.
///
/// `General` means both triangles are present. `Lower` and `Upper` describe
/// symmetric/Hermitian storage where the other triangle is the mirror image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Uplo {
    General,
    Lower,
    Upper,
}

/// Whether a triangular operand has an implicit unit diagonal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Diag {
    Unit,
    NonUnit,
}

/// Matrix norm selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Norm {
    /// Largest absolute entry
    Max,
    /// Largest column sum
    One,
    /// Largest row sum
    Inf,
    /// Square root of the sum of squares
    Fro,
}

/// Factorization recorded on a matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FactorKind {
    Lu,
    Cholesky,
    Indefinite,
    Qr,
}
