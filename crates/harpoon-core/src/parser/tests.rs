use crate::error::HarpoonError;
use crate::loader::{LoadOptions, load_config_str};
use crate::model::*;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn load(yaml: &str) -> crate::error::Result<HarpoonConfig> {
    load_config_str(yaml, Path::new("/project"), &LoadOptions::default())
}

#[test]
fn test_parse_full_image() {
    let yaml = r#"
harpoon:
  image_name_prefix: team
images:
  db:
    commands: ["FROM postgres:16"]
    wait_condition:
      timeout: 10
      wait_between_attempts: 0.01
      port_open: [5432]
      file_exists: [/tmp/ready]
  web:
    image_index: registry.example.com
    tag: "1.2"
    commands:
      - FROM python:3.11
      - [RUN, [pip install -r requirements.txt]]
      - [ADD, {content: "hello", dest: /etc/motd}]
    context:
      exclude: ["*.pyc"]
      use_git: true
      use_git_timestamps: ["src/**"]
    links: ["db:database"]
    volumes:
      mount:
        ./data: /data:ro
      share_with: [db]
    env: [DEBUG=1, "HOME_DIR:/root", TOKEN]
    ports: [8080, "127.0.0.1:9000:9000/udp"]
    dependency_options:
      db:
        attached: true
        wait_condition:
          command: ["pg_isready"]
    memory: 512m
    ulimits: [{name: nofile, soft: 1024}]
    bash: "python app.py"
"#;
    let config = load(yaml).unwrap();
    let web = config.images.require("web").unwrap();

    assert_eq!(web.image_name, "registry.example.com/team-web");
    assert_eq!(web.image_tag(), "registry.example.com/team-web:1.2");
    assert!(web.is_pushable());
    assert_eq!(web.commands.len(), 3);

    assert_eq!(web.context.root_dir, PathBuf::from("/project"));
    assert!(web.context.use_vcs);
    assert_eq!(web.context.use_vcs_mtimes, MtimeMode::Only(vec!["src/**".into()]));

    assert_eq!(
        web.links,
        vec![Link {
            image: "db".into(),
            alias: "database".into()
        }]
    );
    assert_eq!(web.volumes.mounts[0].host, PathBuf::from("/project/./data"));
    assert!(web.volumes.mounts[0].read_only);
    assert_eq!(web.run_dependencies(), vec!["db"]);

    assert_eq!(web.env[1].default.as_deref(), Some("/root"));
    assert_eq!(web.ports[1].transport, Transport::Udp);
    assert_eq!(web.resources.memory, Some(512 * 1024 * 1024));
    assert_eq!(web.resources.ulimits[0].hard, 1024);

    let db = config.images.require("db").unwrap();
    let own = db.wait_condition.as_ref().unwrap();
    assert_eq!(own.timeout, Duration::from_secs(10));
    assert_eq!(own.wait_between_attempts, Duration::from_millis(100));
    assert_eq!(own.probes, vec!["nc -z 127.0.0.1 5432", "test -f '/tmp/ready'"]);

    let options = web.dependency_options_for("db");
    assert!(options.attached);
    assert_eq!(web.wait_condition_for(db).unwrap().probes, vec!["pg_isready"]);
}

#[test]
fn test_tag_override_and_templates() {
    let yaml = r#"
images:
  base:
    tag: v1
    commands: ["FROM alpine:3.20"]
  app:
    commands:
      - FROM base
      - "RUN echo {images.base.image_name}:{images.base.tag} ${HOME}"
    command: "{config_root}/run.sh {$@}"
"#;
    let options = LoadOptions {
        extra: "--fast".into(),
        tag: Some("dev".into()),
        home_config: None,
    };
    let config = load_config_str(yaml, Path::new("/project"), &options).unwrap();

    let base = config.images.require("base").unwrap();
    assert_eq!(base.image_tag(), "base:dev");

    let app = config.images.require("app").unwrap();
    assert_eq!(
        app.commands[1],
        Command::text("RUN", "echo base:dev ${HOME}")
    );
    assert_eq!(
        app.formatted_command().unwrap(),
        vec!["/project/run.sh", "--fast"]
    );
}

#[test]
fn test_image_key_with_dot_is_rejected() {
    let err = load("images:\n  my.app:\n    commands: ['FROM scratch']\n").unwrap_err();
    assert!(matches!(err, HarpoonError::BadSpecValue { .. }));
}

#[test]
fn test_unknown_link_is_rejected() {
    let err = load("images:\n  app:\n    commands: ['FROM scratch']\n    links: [ghost]\n").unwrap_err();
    match err {
        HarpoonError::BadSpecValue { path, .. } => assert_eq!(path, "images.app.links"),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_unknown_image_field_is_rejected() {
    let err = load("images:\n  app:\n    commands: ['FROM scratch']\n    comands: []\n").unwrap_err();
    assert!(matches!(err, HarpoonError::BadSpecValue { .. }));
}

#[test]
fn test_context_shorthand() {
    let config = load("images:\n  app:\n    commands: ['FROM scratch']\n    context: false\n").unwrap();
    assert!(!config.images.require("app").unwrap().context.enabled);
}

#[test]
fn test_tasks_and_authentication() {
    let yaml = r#"
images:
  app:
    commands: ["FROM scratch"]
    tasks:
      shell:
        description: Open a shell
        options:
          bash: /bin/sh
          env: [MODE=dev]
tasks:
  release:
    action: make-all
    description: Build everything
  test:
    image: app
    options:
      command: pytest
authentication:
  registry.example.com:
    reading:
      use: plain
      username: reader
      password: secret
    writing:
      use: environment
      username_env: REG_USER
      password_env: REG_PASS
"#;
    let config = load(yaml).unwrap();

    let shell = &config.tasks["shell"];
    assert_eq!(shell.action, "run");
    assert_eq!(shell.image.as_deref(), Some("app"));
    assert_eq!(shell.overrides.bash.as_deref(), Some("/bin/sh"));

    assert_eq!(config.tasks["release"].action, "make-all");
    assert_eq!(config.tasks["release"].image, None);
    assert_eq!(config.tasks["test"].overrides.command.as_deref(), Some("pytest"));

    let auth = &config.authentication["registry.example.com"];
    assert_eq!(
        auth.reading,
        Some(AuthMethod::Plain {
            username: "reader".into(),
            password: "secret".into()
        })
    );
    assert!(matches!(auth.writing, Some(AuthMethod::Environment { .. })));
}

#[test]
fn test_bad_authentication_method() {
    let yaml = "authentication:\n  r:\n    reading: {use: magic}\n";
    let err = load(yaml).unwrap_err();
    assert!(matches!(err, HarpoonError::BadSpecValue { path, .. } if path == "authentication.r.reading.use"));
}

#[test]
fn test_persistence_defaults() {
    let yaml = "images:\n  app:\n    commands: ['FROM scratch']\n    persistence:\n      action: make\n      folders: [/cache]\n";
    let config = load(yaml).unwrap();
    let persistence = config.images.require("app").unwrap().persistence.clone().unwrap();
    assert_eq!(persistence.shell, "/bin/bash");
    assert!(!persistence.no_provider);
}

#[test]
fn test_command_and_bash_are_exclusive() {
    let yaml = "images:\n  app:\n    commands: ['FROM scratch']\n    command: ls\n    bash: ls\n";
    assert!(matches!(load(yaml), Err(HarpoonError::BadSpecValue { .. })));
}
