// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The JVM command line of a Solr instance.

use std::path::Path;

use crate::command::Invocation;
use crate::layout::InstanceLayout;

/// Launch parameters of one instance, built fresh for every invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    /// Hostname the instance advertises.
    pub hostname: String,
    pub port: u16,
    /// Passed as `-Xmx` when set.
    pub jvm_heap_size: Option<String>,
    pub jvm_opts: Vec<String>,
    /// System properties placed right before `-jar`, e.g. ZooKeeper
    /// settings of shards.
    pub extra_args: Vec<String>,
    /// How many times to probe the port after launching.
    pub connect_retries: u32,
}

impl InstanceSpec {
    /// The `java` invocation that starts jetty for `layout`.
    pub fn to_invocation(
        &self,
        java: &Path,
        layout: &InstanceLayout,
        lucene_match_version: &str,
    ) -> Invocation {
        let data = layout.data_dir.display();
        Invocation::new(java)
            .args(self.jvm_heap_size.iter().map(|heap| format!("-Xmx{heap}")))
            .args(self.jvm_opts.iter().cloned())
            .args([
                "-server".to_string(),
                format!(
                    "-Djava.util.logging.config.file=file://{}",
                    layout.log4j_properties.display()
                ),
                format!("-Djetty.base={data}"),
                format!("-Djetty.home={data}"),
                format!("-Djetty.port={}", self.port),
                format!("-Dsolr.solr.home={data}"),
                format!("-Dsolr.data.dir={data}"),
                format!("-Dhost={}", self.hostname),
                format!("-Dmediacloud.luceneMatchVersion={lucene_match_version}"),
                // Heap dumps on OOM land in the data directory.
                "-XX:+HeapDumpOnOutOfMemoryError".to_string(),
                format!("-XX:HeapDumpPath={data}"),
                // Referenced by `<lib>` paths in solrconfig.xml.
                format!("-Dmediacloud.solr_dist_dir={}", layout.dist_path.display()),
                format!("-Dmediacloud.solr_webapp_dir={}", layout.webapp_dir.display()),
            ])
            .args(self.extra_args.iter().cloned())
            .arg("-jar")
            .arg(layout.start_jar.display().to_string())
            .arg("--module=http")
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn layout() -> InstanceLayout {
        InstanceLayout {
            data_dir: PathBuf::from("/srv/data/mediacloud-cluster-shard-2"),
            log4j_properties: PathBuf::from("/srv/solr/resources/log4j.properties"),
            start_jar: PathBuf::from("/srv/dist/solr-6.5.0/server/start.jar"),
            webapp_dir: PathBuf::from("/srv/dist/solr-6.5.0/server/solr-webapp"),
            dist_path: PathBuf::from("/srv/dist/solr-6.5.0"),
        }
    }

    #[test]
    fn test_argument_order() {
        let spec = InstanceSpec {
            hostname: "solr2.example.net".into(),
            port: 7982,
            jvm_heap_size: Some("4g".into()),
            jvm_opts: vec!["-XX:+UseG1GC".into()],
            extra_args: vec![
                "-DzkHost=zk:9983".into(),
                "-DnumShards=2".into(),
            ],
            connect_retries: 300,
        };
        let invocation = spec.to_invocation(Path::new("java"), &layout(), "6.5.0");
        assert_eq!(invocation.program, PathBuf::from("java"));
        let data = "/srv/data/mediacloud-cluster-shard-2";
        let expected = vec![
            "-Xmx4g".to_string(),
            "-XX:+UseG1GC".into(),
            "-server".into(),
            "-Djava.util.logging.config.file=file:///srv/solr/resources/log4j.properties".into(),
            format!("-Djetty.base={data}"),
            format!("-Djetty.home={data}"),
            "-Djetty.port=7982".into(),
            format!("-Dsolr.solr.home={data}"),
            format!("-Dsolr.data.dir={data}"),
            "-Dhost=solr2.example.net".into(),
            "-Dmediacloud.luceneMatchVersion=6.5.0".into(),
            "-XX:+HeapDumpOnOutOfMemoryError".into(),
            format!("-XX:HeapDumpPath={data}"),
            "-Dmediacloud.solr_dist_dir=/srv/dist/solr-6.5.0".into(),
            "-Dmediacloud.solr_webapp_dir=/srv/dist/solr-6.5.0/server/solr-webapp".into(),
            "-DzkHost=zk:9983".into(),
            "-DnumShards=2".into(),
            "-jar".into(),
            "/srv/dist/solr-6.5.0/server/start.jar".into(),
            "--module=http".into(),
        ];
        assert_eq!(invocation.args, expected);
    }

    #[test]
    fn test_heap_size_is_optional() {
        let spec = InstanceSpec {
            hostname: "localhost".into(),
            port: 8983,
            jvm_heap_size: None,
            jvm_opts: vec![],
            extra_args: vec![],
            connect_retries: 1,
        };
        let invocation = spec.to_invocation(Path::new("java"), &layout(), "6.5.0");
        assert_eq!(invocation.args[0], "-server");
        assert!(!invocation.args.iter().any(|a| a.starts_with("-Xmx")));
    }
}
