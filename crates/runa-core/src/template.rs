// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use runa_config::{PermissionConfig, RuntimeOptions};

use crate::hooks::HookSet;

/// Declarative agent blueprint: system prompt, tool allow-list, permission
/// config, runtime flags, and lifecycle hooks.
///
/// Hooks are ordered lists of function values and are not serialized;
/// everything else is plain data.
#[derive(Clone, Default)]
pub struct Template {
    pub id: String,
    pub system_prompt: String,
    /// Tool names this agent may use.  Empty means every registered tool.
    pub tools: Vec<String>,
    pub permission: PermissionConfig,
    pub runtime: RuntimeOptions,
    pub hooks: HookSet,
}

impl Template {
    pub fn builder(id: impl Into<String>) -> TemplateBuilder {
        TemplateBuilder {
            template: Template {
                id: id.into(),
                ..Default::default()
            },
        }
    }

    /// The allow-list in the form the tool registry expects.
    pub fn tool_allow_list(&self) -> Option<&[String]> {
        if self.tools.is_empty() {
            None
        } else {
            Some(&self.tools)
        }
    }
}

pub struct TemplateBuilder {
    template: Template,
}

impl TemplateBuilder {
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.template.system_prompt = prompt.into();
        self
    }

    pub fn tools(mut self, tools: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.template.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn permission(mut self, permission: PermissionConfig) -> Self {
        self.template.permission = permission;
        self
    }

    pub fn runtime(mut self, runtime: RuntimeOptions) -> Self {
        self.template.runtime = runtime;
        self
    }

    pub fn hooks(mut self, hooks: HookSet) -> Self {
        self.template.hooks = hooks;
        self
    }

    pub fn build(self) -> Arc<Template> {
        Arc::new(self.template)
    }
}

/// Registry of templates, keyed by id.
///
/// Populated during startup; read-only at runtime.
#[derive(Default)]
pub struct TemplateRegistry {
    templates: RwLock<HashMap<String, Arc<Template>>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, template: Arc<Template>) {
        self.templates
            .write()
            .unwrap()
            .insert(template.id.clone(), template);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Template>> {
        self.templates.read().unwrap().get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.templates.read().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
