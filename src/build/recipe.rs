// src/build/recipe.rs

//! Build recipes
//!
//! A recipe is a TOML document carrying package identity, per-stage shell
//! bodies, extra environment variables, build dependencies, and the
//! static-library keep-list. Prepare, build, and install bodies are
//! mandatory; the check stage is optional and skipped when absent.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use strum_macros::Display;

/// Fixed ordered stage list of one build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum BuildStage {
    Prepare,
    Build,
    Check,
    Install,
}

impl BuildStage {
    pub const ALL: [BuildStage; 4] = [Self::Prepare, Self::Build, Self::Check, Self::Install];

    /// Stages a recipe must define.
    pub fn is_required(&self) -> bool {
        !matches!(self, Self::Check)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecipePackage {
    pub name: String,
    pub version: String,
    pub release: String,
    #[serde(default)]
    pub epoch: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecipeStages {
    pub prepare: Option<String>,
    pub build: Option<String>,
    pub check: Option<String>,
    pub install: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecipeOptions {
    /// Glob patterns for static libraries spared from pruning
    #[serde(default)]
    pub keep_static_libs: Vec<String>,
}

/// One parsed build recipe.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildRecipe {
    pub package: RecipePackage,
    #[serde(default)]
    pub stages: RecipeStages,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub build_requires: Vec<String>,
    #[serde(default)]
    pub options: RecipeOptions,
}

impl BuildRecipe {
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Build(format!("no build recipe at {}: {}", path.display(), e)))?;
        let recipe = Self::from_str(&text)?;
        Ok(recipe)
    }

    pub fn from_str(text: &str) -> Result<Self> {
        let recipe: BuildRecipe = toml::from_str(text)?;
        recipe.validate()?;
        Ok(recipe)
    }

    fn validate(&self) -> Result<()> {
        for stage in BuildStage::ALL {
            if stage.is_required()
                && self.stage_body(stage).map(str::trim).unwrap_or("").is_empty()
            {
                return Err(Error::Build(format!(
                    "recipe for {} is missing its {} stage",
                    self.package.name, stage
                )));
            }
        }
        Ok(())
    }

    pub fn stage_body(&self, stage: BuildStage) -> Option<&str> {
        match stage {
            BuildStage::Prepare => self.stages.prepare.as_deref(),
            BuildStage::Build => self.stages.build.as_deref(),
            BuildStage::Check => self.stages.check.as_deref(),
            BuildStage::Install => self.stages.install.as_deref(),
        }
    }

    /// Render the executable script for a stage; `None` when the stage is
    /// absent (possible only for optional stages after validation).
    pub fn render_stage_script(&self, stage: BuildStage) -> Option<String> {
        let body = self.stage_body(stage)?;
        Some(format!("#!/bin/sh\nset -eu\ncd /build\n\n{}\n", body))
    }
}
