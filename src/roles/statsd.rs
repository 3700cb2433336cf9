//! `node` and `statsd` roles

use super::Vars;
use crate::steps::{Exec, GitCheckout, Guard, Package, RemoteFile, Service};
use crate::templates::{STATSD_CONFIG, STATSD_MONIT, STATSD_UPSTART};
use anyhow::Result;
use declarative::{Plan, RoleParams};

pub const REPOSITORY: &str = "git://github.com/etsy/statsd.git";

const NODE_PPA: &str = "ppa:chris-lea/node.js";
const STATSD_JOB: &str = "/etc/init/statsd.conf";
const STATSD_CHECK: &str = "/etc/monit/conf.d/statsd.conf";

fn config_path(vars: &Vars) -> String {
    format!("{}/localConfig.js", vars.get("statsd_root"))
}

pub fn node(params: &RoleParams) -> Result<Plan> {
    let vars = Vars::new(params);
    let root = vars.get("statsd_root");

    let mut plan = Plan::new("node");
    plan.add(Exec::new(
        "exec:apt-update",
        "apt-get update",
        Guard::once("apt-update"),
    ))
    .add(Package::apt(["python-software-properties"]).after(["exec:apt-update"]))
    .add(
        Exec::new(
            "exec:nodejs-ppa",
            format!("apt-add-repository -y {}", NODE_PPA),
            Guard::once("nodejs-ppa"),
        )
        .undo_with(format!("apt-add-repository -y --remove {}", NODE_PPA))
        .after(["package:python-software-properties"]),
    )
    .add(
        Exec::new(
            "exec:apt-update-nodejs",
            "apt-get update",
            Guard::once("apt-update-nodejs"),
        )
        .after(["exec:nodejs-ppa"]),
    )
    .add(Package::apt(["nodejs"]).after(["exec:apt-update-nodejs"]))
    .add(Package::apt(["git"]).after(["exec:apt-update"]))
    .add(GitCheckout::new(REPOSITORY, root).after(["package:git"]))
    .add(
        RemoteFile::new(config_path(&vars), vars.render(&STATSD_CONFIG)?)
            .after([format!("git:{}", root)]),
    );
    Ok(plan)
}

pub fn statsd(params: &RoleParams) -> Result<Plan> {
    let vars = Vars::new(params);

    let mut plan = Plan::new("statsd");
    plan.add(RemoteFile::new(STATSD_JOB, vars.render(&STATSD_UPSTART)?))
        .add(
            Service::new("statsd")
                .watching(STATSD_JOB)
                .watching(config_path(&vars))
                .after([format!("file:{}", STATSD_JOB)]),
        )
        .add(RemoteFile::new(STATSD_CHECK, vars.render(&STATSD_MONIT)?))
        .add(
            Service::new("monit")
                .named("service:monit-statsd")
                .watching(STATSD_CHECK)
                .after(["service:statsd".to_string(), format!("file:{}", STATSD_CHECK)]),
        );
    Ok(plan)
}
