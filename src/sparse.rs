//! Compressed sparse column matrices built from coordinate triplets.
use faer::Mat;
use num_traits::Float;

/// Coordinate list of matrix entries, used while the pattern is unknown.
#[derive(Clone, Debug, PartialEq)]
pub struct TripletMatrix<T> {
    nrows: usize,
    ncols: usize,
    entries: Vec<(usize, usize, T)>,
}

impl<T> TripletMatrix<T> {
    pub fn new(nrows: usize, ncols: usize) -> Self {
        Self {
            nrows,
            ncols,
            entries: Vec::new(),
        }
    }

    pub fn with_capacity(nrows: usize, ncols: usize, capacity: usize) -> Self {
        Self {
            nrows,
            ncols,
            entries: Vec::with_capacity(capacity),
        }
    }
    /// Appends an entry. Entries at the same position are summed on
    /// conversion.
    ///
    /// # Panics
    ///
    /// Panics if the position is outside the matrix.
    pub fn push(&mut self, row: usize, col: usize, value: T) {
        assert!(
            row < self.nrows && col < self.ncols,
            "entry ({row}, {col}) outside a {}x{} matrix",
            self.nrows,
            self.ncols
        );
        self.entries.push((row, col, value));
    }

    pub fn nnz(&self) -> usize {
        self.entries.len()
    }
}

/// Sparse matrix stored column by column with sorted row indices.
///
/// # Examples
///
/// ```
/// use trigsim::sparse::{CscMatrix, TripletMatrix};
///
/// let mut triplets = TripletMatrix::new(2, 2);
/// triplets.push(1, 0, 2.0);
/// triplets.push(0, 1, 3.0);
/// triplets.push(0, 0, 1.0);
///
/// let matrix = CscMatrix::from(triplets);
/// assert_eq!(matrix.mul_vec(&[1.0, 1.0]), vec![4.0, 2.0]);
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct CscMatrix<T> {
    nrows: usize,
    ncols: usize,
    col_ptr: Vec<usize>,
    row_idx: Vec<usize>,
    values: Vec<T>,
}

impl<T: Float> From<TripletMatrix<T>> for CscMatrix<T> {
    fn from(triplets: TripletMatrix<T>) -> Self {
        let TripletMatrix {
            nrows,
            ncols,
            mut entries,
        } = triplets;
        // Stable, so same-position entries keep their insertion order.
        entries.sort_by_key(|&(row, col, _)| (col, row));

        let mut col_ptr = vec![0; ncols + 1];
        let mut row_idx = Vec::with_capacity(entries.len());
        let mut values: Vec<T> = Vec::with_capacity(entries.len());
        let mut last = None;
        for (row, col, value) in entries {
            if last == Some((row, col)) {
                if let Some(v) = values.last_mut() {
                    *v = *v + value;
                }
                continue;
            }
            last = Some((row, col));
            row_idx.push(row);
            values.push(value);
            col_ptr[col + 1] += 1;
        }
        for j in 0..ncols {
            col_ptr[j + 1] += col_ptr[j];
        }

        Self {
            nrows,
            ncols,
            col_ptr,
            row_idx,
            values,
        }
    }
}

impl<T: Float> CscMatrix<T> {
    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }
    /// Row indices and values of column `j`.
    pub fn column(&self, j: usize) -> (&[usize], &[T]) {
        let range = self.col_ptr[j]..self.col_ptr[j + 1];
        (&self.row_idx[range.clone()], &self.values[range])
    }
    /// Computes `A x`.
    pub fn mul_vec(&self, x: &[T]) -> Vec<T> {
        let mut y = vec![T::zero(); self.nrows];
        for (j, &xj) in x.iter().enumerate().take(self.ncols) {
            if xj == T::zero() {
                continue;
            }
            let (rows, values) = self.column(j);
            for (&i, &v) in rows.iter().zip(values) {
                y[i] = y[i] + v * xj;
            }
        }
        y
    }
    /// Computes `Aᵀ y`.
    pub fn transpose_mul_vec(&self, y: &[T]) -> Vec<T> {
        (0..self.ncols).map(|j| self.column_dot_dense(j, y)).collect()
    }
    /// Dot product of column `j` with a dense vector.
    pub fn column_dot_dense(&self, j: usize, y: &[T]) -> T {
        let (rows, values) = self.column(j);
        rows.iter()
            .zip(values)
            .fold(T::zero(), |acc, (&i, &v)| acc + v * y[i])
    }
    /// Dot product of columns `a` and `b`.
    pub fn column_dot(&self, a: usize, b: usize) -> T {
        let (rows_a, values_a) = self.column(a);
        let (rows_b, values_b) = self.column(b);

        let mut sum = T::zero();
        let (mut p, mut q) = (0, 0);
        while p < rows_a.len() && q < rows_b.len() {
            match rows_a[p].cmp(&rows_b[q]) {
                std::cmp::Ordering::Less => p += 1,
                std::cmp::Ordering::Greater => q += 1,
                std::cmp::Ordering::Equal => {
                    sum = sum + values_a[p] * values_b[q];
                    p += 1;
                    q += 1;
                }
            }
        }
        sum
    }
}

impl CscMatrix<f64> {
    /// Dense normal-equation block `A_Sᵀ A_S` for the columns in `cols`.
    pub fn gram(&self, cols: &[usize]) -> Mat<f64> {
        let n = cols.len();
        let mut gram = Mat::<f64>::zeros(n, n);
        for (a, &ca) in cols.iter().enumerate() {
            for (b, &cb) in cols.iter().enumerate().skip(a) {
                let value = self.column_dot(ca, cb);
                gram[(a, b)] = value;
                gram[(b, a)] = value;
            }
        }
        gram
    }
}
