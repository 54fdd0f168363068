pub mod iterations;
