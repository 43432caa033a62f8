pub use {anyhow,
         itertools,
         log,
         ndarray,
         polars,
         statrs};
