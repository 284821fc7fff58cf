//! 主机清单
//!
//! YAML 文档：分组名 -> 成员列表。成员是主机条目字符串，或只有一个键的
//! 映射（子分组，可任意嵌套）。主机条目为 `name:address:port` 或
//! `name-address:port`。

use anyhow::{anyhow, bail, Context};
use serde::Deserialize;
use serde_yaml::Mapping;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use tracing::{debug, warn};

/// 一台目标主机
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostTarget {
    pub name: String,
    pub address: String,
    pub port: u16,
}

impl HostTarget {
    /// 解析主机条目
    pub fn parse(entry: &str) -> anyhow::Result<Self> {
        let invalid = || anyhow!("无效的主机条目: \"{}\"", entry);
        let (rest, port) = entry.trim().rsplit_once(':').ok_or_else(invalid)?;
        let port: u16 = port.trim().parse().map_err(|_| invalid())?;
        let (name, address) = rest
            .split_once(':')
            .or_else(|| rest.rsplit_once('-'))
            .ok_or_else(invalid)?;
        let (name, address) = (name.trim(), address.trim());
        if name.is_empty() || address.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            name: name.to_string(),
            address: address.to_string(),
            port,
        })
    }
}

impl fmt::Display for HostTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}:{})", self.name, self.address, self.port)
    }
}

/// YAML 中的一个成员：主机条目字符串，或只有一个键的子分组
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawMember {
    Entry(String),
    Group(BTreeMap<String, Option<Vec<RawMember>>>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Member {
    Host(HostTarget),
    Group(Group),
}

impl Member {
    fn from_raw(group: &str, raw: RawMember) -> anyhow::Result<Self> {
        match raw {
            RawMember::Entry(entry) => Ok(Member::Host(HostTarget::parse(&entry)?)),
            RawMember::Group(sub) => {
                if sub.len() != 1 {
                    bail!("分组 {} 中的子分组必须只有一个名称", group);
                }
                let Some((name, members)) = sub.into_iter().next() else {
                    bail!("分组 {} 中有空的子分组", group);
                };
                Ok(Member::Group(Group::from_raw(name, members)?))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub name: String,
    pub members: Vec<Member>,
}

impl Group {
    fn from_raw(name: String, members: Option<Vec<RawMember>>) -> anyhow::Result<Self> {
        let members = members
            .unwrap_or_default()
            .into_iter()
            .map(|raw| Member::from_raw(&name, raw))
            .collect::<anyhow::Result<_>>()?;
        Ok(Self { name, members })
    }

    /// 分组下的全部主机（含子分组），按文档顺序
    pub fn hosts(&self) -> Vec<&HostTarget> {
        let mut hosts = Vec::new();
        self.collect_hosts(&mut hosts);
        hosts
    }

    fn collect_hosts<'a>(&'a self, out: &mut Vec<&'a HostTarget>) {
        for member in &self.members {
            match member {
                Member::Host(host) => out.push(host),
                Member::Group(group) => group.collect_hosts(out),
            }
        }
    }

    fn find_group(&self, name: &str) -> Option<&Group> {
        if self.name == name {
            return Some(self);
        }
        self.members.iter().find_map(|member| match member {
            Member::Group(group) => group.find_group(name),
            Member::Host(_) => None,
        })
    }
}

/// 解析后的主机清单
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registry {
    groups: Vec<Group>,
}

impl Registry {
    /// 从文件加载
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("读取主机清单失败: {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("主机清单格式错误: {}", path.display()))
    }

    /// 顶层分组保持文档顺序
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let document: Option<Mapping> =
            serde_yaml::from_str(content).context("顶层必须是 分组名 -> 成员列表 的映射")?;

        let mut groups = Vec::new();
        for (key, value) in document.unwrap_or_default() {
            let name: String = serde_yaml::from_value(key).context("分组名必须是字符串")?;
            let members: Option<Vec<RawMember>> = serde_yaml::from_value(value)
                .with_context(|| format!("分组 {} 的成员必须是主机条目或子分组的列表", name))?;
            groups.push(Group::from_raw(name, members)?);
        }
        Ok(Self { groups })
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    /// 全部主机，按文档顺序
    pub fn all_hosts(&self) -> Vec<&HostTarget> {
        self.groups.iter().flat_map(|g| g.hosts()).collect()
    }

    fn find_group(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find_map(|g| g.find_group(name))
    }

    /// 把命令行给出的目标解析为主机列表
    ///
    /// 单独的 `all` 表示全部主机；否则每个目标依次尝试：主机名完全匹配、
    /// 分组名完全匹配（任意层级）、主机名或地址包含该字符串（只取文档中
    /// 第一个）。结果去重并保持首次出现的顺序。
    pub fn resolve(&self, targets: &[String]) -> anyhow::Result<Vec<HostTarget>> {
        let all = self.all_hosts();
        let mut fleet: Vec<&HostTarget> = Vec::new();

        if targets.len() == 1 && targets[0] == "all" {
            fleet = all.clone();
        } else {
            for token in targets {
                if let Some(host) = all.iter().find(|h| &h.name == token) {
                    fleet.push(*host);
                } else if let Some(group) = self.find_group(token) {
                    fleet.extend(group.hosts());
                } else if let Some(host) = all
                    .iter()
                    .find(|h| h.name.contains(token.as_str()) || h.address.contains(token.as_str()))
                {
                    debug!("目标 {} 模糊匹配到 {}", token, host);
                    fleet.push(*host);
                } else {
                    warn!("没有匹配的主机或分组: {}", token);
                }
            }
        }

        let mut seen = HashSet::new();
        let fleet: Vec<HostTarget> = fleet
            .into_iter()
            .filter(|h| seen.insert(*h))
            .cloned()
            .collect();
        if fleet.is_empty() {
            bail!("没有匹配的目标主机: {}", targets.join(" "));
        }
        Ok(fleet)
    }
}
