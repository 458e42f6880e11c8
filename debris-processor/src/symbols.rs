//! The symbol-provider seam between stack walking and symbol loading.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use debris_dump::Module;

pub use debris_symbols::{
    FillSymbolError, FrameSymbolizer, FrameWalker, SimpleSymbolSupplier, StringSymbolSupplier,
    SymbolError, SymbolFile, SymbolStats, SymbolSupplier, Symbolizer, WalkError,
};

/// What the processor needs from a symbol source.
///
/// Implemented by [`Symbolizer`]; [`MultiSymbolProvider`] chains several.
/// All methods may be called concurrently; implementations coalesce
/// per-module work themselves. These calls are the processor's only
/// suspension points, and an `Interrupted` error from any of them aborts
/// the walk cooperatively.
#[async_trait]
pub trait SymbolProvider {
    /// Fill function/source info (and inline frames) for one frame.
    ///
    /// Doubles as the stack scanner's plausibility oracle: an address that
    /// symbolizes to nothing inside a known module is a poor return-address
    /// candidate.
    async fn fill_symbol(
        &self,
        module: &(dyn Module + Sync),
        frame: &mut (dyn FrameSymbolizer + Send),
    ) -> Result<(), FillSymbolError>;

    /// Evaluate unwind rules for the walker's frame, writing the caller's
    /// registers through the walker's callbacks.
    async fn walk_frame(
        &self,
        module: &(dyn Module + Sync),
        walker: &mut (dyn FrameWalker + Send),
    ) -> Result<(), WalkError>;

    /// Per-module statistics, gathered after processing.
    fn stats(&self) -> HashMap<String, SymbolStats> {
        HashMap::new()
    }
}

#[async_trait]
impl SymbolProvider for Symbolizer {
    async fn fill_symbol(
        &self,
        module: &(dyn Module + Sync),
        frame: &mut (dyn FrameSymbolizer + Send),
    ) -> Result<(), FillSymbolError> {
        self.fill_symbol(module, frame).await
    }

    async fn walk_frame(
        &self,
        module: &(dyn Module + Sync),
        walker: &mut (dyn FrameWalker + Send),
    ) -> Result<(), WalkError> {
        self.walk_frame(module, walker).await
    }

    fn stats(&self) -> HashMap<String, SymbolStats> {
        self.stats()
    }
}

/// Chains several providers; the first that produces a result wins.
#[derive(Default)]
pub struct MultiSymbolProvider {
    providers: Vec<Box<dyn SymbolProvider + Send + Sync>>,
}

impl MultiSymbolProvider {
    pub fn new() -> MultiSymbolProvider {
        Default::default()
    }

    pub fn add(&mut self, provider: Box<dyn SymbolProvider + Send + Sync>) {
        self.providers.push(provider);
    }
}

#[async_trait]
impl SymbolProvider for MultiSymbolProvider {
    async fn fill_symbol(
        &self,
        module: &(dyn Module + Sync),
        frame: &mut (dyn FrameSymbolizer + Send),
    ) -> Result<(), FillSymbolError> {
        // Ok if anyone succeeded, so callers can tell "no symbols at all"
        // from "this frame didn't symbolize"; an interrupt wins outright.
        let mut best: Result<(), FillSymbolError> = Err(FillSymbolError::NotFound);
        for p in &self.providers {
            match p.fill_symbol(module, frame).await {
                Err(FillSymbolError::Interrupted) => return Err(FillSymbolError::Interrupted),
                result => best = best.or(result),
            }
        }
        best
    }

    async fn walk_frame(
        &self,
        module: &(dyn Module + Sync),
        walker: &mut (dyn FrameWalker + Send),
    ) -> Result<(), WalkError> {
        for p in &self.providers {
            match p.walk_frame(module, walker).await {
                Err(WalkError::NoUnwindInfo) => continue,
                result => return result,
            }
        }
        Err(WalkError::NoUnwindInfo)
    }

    fn stats(&self) -> HashMap<String, SymbolStats> {
        let mut result = HashMap::new();
        for p in &self.providers {
            result.extend(p.stats());
        }
        result
    }
}

/// A [`SymbolSupplier`] over local disk paths.
pub fn simple_symbol_supplier(symbol_paths: Vec<PathBuf>) -> impl SymbolSupplier {
    SimpleSymbolSupplier::new(symbol_paths)
}

/// A mock [`SymbolSupplier`] mapping module names to whole symbol files,
/// for tests.
pub fn string_symbol_supplier(modules: HashMap<String, String>) -> impl SymbolSupplier {
    StringSymbolSupplier::new(modules)
}
