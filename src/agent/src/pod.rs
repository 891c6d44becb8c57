use std::{net::IpAddr, str::FromStr};

use super::error::Error;

// K8S_POD_INFRA_CONTAINER_ID=0a6a4b09df59d64e3be5cf662808076fee664447a1c90dd05a5d5588e2cd6b5a;K8S_POD_UID=b0e1fc4a-f842-4ec2-8e23-8c0c8da7b5e5;IgnoreUnknown=1;K8S_POD_NAMESPACE=kube-system;K8S_POD_NAME=coredns-787d4945fb-7xrrd
const K8S_POD_INFRA_CONTAINER_ID: &str = "K8S_POD_INFRA_CONTAINER_ID";
const K8S_POD_UID: &str = "K8S_POD_UID";
const K8S_POD_NAMESPACE: &str = "K8S_POD_NAMESPACE";
const K8S_POD_NAME: &str = "K8S_POD_NAME";
const IP: &str = "IP";
const K8S_POD_STICKY: &str = "K8S_POD_STICKY";
const K8S_POD_SANDBOX_EXITED: &str = "K8S_POD_SANDBOX_EXITED";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodInfo {
    pub container_id: String,
    pub uid: String,
    pub namespace: String,
    pub name: String,
    /// Addresses requested through the `IP` argument.
    pub ips: Vec<IpAddr>,
    /// The pod wants the same address back after a restart.
    pub sticky: bool,
    /// The sandbox is gone but the pod is not deleted yet.
    pub sandbox_exited: bool,
}

impl PodInfo {
    /// Owner key used by pooled networks. Stable across container restarts.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl FromStr for PodInfo {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut info = PodInfo::default();
        for kv in s.split(';') {
            let Some((key, value)) = kv.split_once('=') else {
                continue;
            };
            match key {
                K8S_POD_INFRA_CONTAINER_ID => info.container_id = value.to_string(),
                K8S_POD_UID => info.uid = value.to_string(),
                K8S_POD_NAMESPACE => info.namespace = value.to_string(),
                K8S_POD_NAME => info.name = value.to_string(),
                K8S_POD_STICKY => info.sticky = value.eq_ignore_ascii_case("true"),
                K8S_POD_SANDBOX_EXITED => info.sandbox_exited = value.eq_ignore_ascii_case("true"),
                IP => {
                    info.ips = value
                        .split(',')
                        .filter(|a| !a.is_empty())
                        .map(|a| {
                            // accept both plain addresses and CIDR notation
                            let addr = a.split('/').next().unwrap_or(a);
                            IpAddr::from_str(addr)
                                .map_err(|_| Error::MissingField(format!("{IP}={a}")))
                        })
                        .collect::<Result<Vec<IpAddr>, Error>>()?
                }
                _ => {}
            }
        }
        for (key, value) in [
            (K8S_POD_INFRA_CONTAINER_ID, &info.container_id),
            (K8S_POD_UID, &info.uid),
            (K8S_POD_NAMESPACE, &info.namespace),
            (K8S_POD_NAME, &info.name),
        ] {
            if value.is_empty() {
                return Err(Error::MissingField(format!("{} is not set", key)));
            }
        }
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_pod_info_from_str() {
        let s = "K8S_POD_INFRA_CONTAINER_ID=0a6a4b09df59d64e3be5cf662808076fee664447a1c90dd05a5d5588e2cd6b5a;K8S_POD_UID=b0e1fc4a-f842-4ec2-8e23-8c0c8da7b5e5;IgnoreUnknown=1;K8S_POD_NAMESPACE=kube-system;K8S_POD_NAME=coredns-787d4945fb-7xrrd";
        let expected = PodInfo {
            container_id: "0a6a4b09df59d64e3be5cf662808076fee664447a1c90dd05a5d5588e2cd6b5a"
                .to_string(),
            uid: "b0e1fc4a-f842-4ec2-8e23-8c0c8da7b5e5".to_string(),
            namespace: "kube-system".to_string(),
            name: "coredns-787d4945fb-7xrrd".to_string(),
            ..Default::default()
        };
        let info = PodInfo::from_str(s).unwrap();
        assert_eq!(expected, info);
        assert_eq!(info.key(), "kube-system/coredns-787d4945fb-7xrrd");
    }

    #[test]
    fn test_pod_info_with_ip_and_sticky() {
        let s = "K8S_POD_INFRA_CONTAINER_ID=c;K8S_POD_UID=u;K8S_POD_NAMESPACE=default;K8S_POD_NAME=web-0;IP=10.0.0.5/24,10.0.0.6;K8S_POD_STICKY=true";
        let info = PodInfo::from_str(s).unwrap();
        assert_eq!(
            info.ips,
            vec![
                IpAddr::from_str("10.0.0.5").unwrap(),
                IpAddr::from_str("10.0.0.6").unwrap()
            ]
        );
        assert!(info.sticky);
        assert!(!info.sandbox_exited);
    }

    #[rstest(
        flags,
        sticky,
        sandbox_exited,
        case("", false, false),
        case(";K8S_POD_STICKY=TRUE", true, false),
        case(";K8S_POD_STICKY=false", false, false),
        case(";K8S_POD_SANDBOX_EXITED=true", false, true),
        case(";K8S_POD_STICKY=true;K8S_POD_SANDBOX_EXITED=True", true, true),
        case(";K8S_POD_SANDBOX_EXITED=1", false, false),
    )]
    fn test_pod_info_flags(flags: &str, sticky: bool, sandbox_exited: bool) {
        let s = format!(
            "K8S_POD_INFRA_CONTAINER_ID=c;K8S_POD_UID=u;K8S_POD_NAMESPACE=n;K8S_POD_NAME=p{flags}"
        );
        let info = PodInfo::from_str(&s).unwrap();
        assert_eq!(info.sticky, sticky);
        assert_eq!(info.sandbox_exited, sandbox_exited);
    }

    #[rstest(
        args,
        case("K8S_POD_UID=u;K8S_POD_NAMESPACE=n;K8S_POD_NAME=p"),
        case("K8S_POD_INFRA_CONTAINER_ID=c;K8S_POD_NAMESPACE=n;K8S_POD_NAME=p"),
        case("K8S_POD_INFRA_CONTAINER_ID=c;K8S_POD_UID=u;K8S_POD_NAME=p"),
        case("K8S_POD_INFRA_CONTAINER_ID=c;K8S_POD_UID=u;K8S_POD_NAMESPACE=n"),
        case("K8S_POD_INFRA_CONTAINER_ID=c;K8S_POD_UID=u;K8S_POD_NAMESPACE=n;K8S_POD_NAME=p;IP=bogus"),
    )]
    fn test_pod_info_from_str_fails(args: &str) {
        assert!(matches!(
            PodInfo::from_str(args),
            Err(Error::MissingField(_))
        ));
    }
}
